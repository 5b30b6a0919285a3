#![cfg_attr(not(test), no_std)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Async, `no_std` driver core for the Zinitix BT532 (ZT75xx family)
//! capacitive touchscreen controller.
//!
//! The crate turns controller interrupts into a deduplicated multi-finger
//! event stream and keeps the controller alive on its own:
//!
//! - Power sequencing with chip detection and bounded bring-up retries
//! - Cold and warm initialisation, including checksum validation, hardware
//!   calibration and firmware upgrade with full read-back verification
//! - A session arbiter that lets exactly one operation talk to the device at a
//!   time, so interrupts, the recovery watchdog and diagnostic commands never
//!   interleave on the bus
//! - Slot tracking that emits down, move and lift transitions with
//!   orientation transforms, clamping and palm handling
//! - `embedded-hal` / `embedded-hal-async` 1.0 traits for the bus and delays
//!
//! The device is owned by a [`Runner`] task. Every other context talks to it
//! through a [`Handle`]:
//!
//! ```no_run
//! use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
//! use embedded_hal_async::{delay::DelayNs, i2c::{I2c, SevenBitAddress}};
//! use bt532::{Board, Bt532, Config, InputSink, Runner, Shared};
//!
//! static SHARED: Shared<CriticalSectionRawMutex, MyBusError> = Shared::new();
//!
//! async fn touch_task<I, B, S, D, T>(i2c: I, board: B, sink: S, delay: D, timer: T)
//! where
//!   I: I2c<SevenBitAddress, Error = MyBusError>,
//!   B: Board,
//!   S: InputSink,
//!   D: DelayNs,
//!   T: DelayNs + Clone,
//! {
//!   let device = Bt532::new(i2c, board, sink, delay, Config::new(720, 1280));
//!   let mut runner = Runner::new(&SHARED, device, timer);
//!   if runner.probe().await.is_ok() {
//!     _ = runner.run().await;
//!   }
//! }
//!
//! // From the interrupt handler:
//! fn on_touch_irq() {
//!   SHARED.handle().handle_interrupt();
//! }
//! ```

mod fmt;

mod board;
mod calibration;
mod config;
mod defs;
mod diag;
mod event;
mod firmware;
mod init;
mod power;
mod runner;
mod rw;
mod session;
mod touchpad;

#[cfg(test)]
mod sim;

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};

pub use board::{Board, InputSink};
pub use calibration::Calibration;
pub use config::{Config, Orientation, TouchMode};
pub use defs::{
  Chip, IconStatus, OptionalMode, PointStatus, SubStatus, MAX_BUTTONS, MAX_FINGERS, MAX_RAW_NODES,
  POINT_RECORD_MAX, RAW_CAPTURE_CAPACITY,
};
pub use diag::RawCapture;
pub use event::{PointRecord, TouchSlot};
pub use firmware::FirmwareImage;
pub use init::Capabilities;
pub use power::PowerControl;
pub use runner::{Handle, OptionalFlag, Runner, Shared, IRQ_QUEUE_DEPTH};
pub use session::{Arbiter, SessionGuard, SessionState};
pub use touchpad::{ButtonState, Contact, InputEvent, TouchPhase, Tracker};

/// Errors that can occur while driving the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
  /// I²C transaction failed after the retry budget was spent.
  I2c(E),
  /// A write payload does not fit in a single transaction.
  BufferOverflow,
  /// The firmware integrity register did not hold the valid sentinel.
  ChecksumInvalid(u16),
  /// The point status word had a reserved bit set or carried a reset marker.
  ProtocolViolation(u16),
  /// Power rails or the bring-up sequence failed after all retries.
  PowerSequence,
  /// Flashing or read-back verification failed after all retries.
  UpgradeFailed,
  /// The firmware image does not fit the detected flash geometry.
  InvalidImage,
  /// Another session holds the device; retry later.
  Busy,
  /// The requested transition is not allowed from the held session.
  InvalidTransition(SessionState),
  /// The interrupt line did not assert in time.
  Timeout,
  /// The operation needs capabilities that are only known after probing.
  NotReady,
}

/// Device handle for a BT532 controller.
///
/// Owns the bus, the board services, the event sink and a delay source. All
/// register sequences run through `&mut self`, so the only way to share a
/// device between contexts is to hand it to a [`Runner`].
pub struct Bt532<I, B, S, D> {
  i2c: I,
  board: B,
  sink: S,
  delay: D,
  config: Config,
  chip: Chip,
  powered: bool,
  caps: Option<Capabilities>,
  touch_mode: TouchMode,
  optional: OptionalState,
  tracker: Tracker,
  raw: RawCapture,
}

#[derive(Debug, Clone, Copy, Default)]
struct OptionalState {
  base: u16,
  desired: OptionalMode,
  written: Option<u16>,
}

impl<I, B, S, D> Bt532<I, B, S, D> {
  pub fn new(i2c: I, board: B, sink: S, delay: D, config: Config) -> Self {
    Self {
      i2c,
      board,
      sink,
      delay,
      config,
      chip: Chip::default(),
      powered: false,
      caps: None,
      touch_mode: TouchMode::Point,
      optional: OptionalState::default(),
      tracker: Tracker::new(config.buttons),
      raw: RawCapture::new(),
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  /// Capabilities discovered by the last cold init.
  pub fn capabilities(&self) -> Option<Capabilities> {
    self.caps
  }

  /// Chip detected by the last bring-up sequence.
  pub fn chip(&self) -> Chip {
    self.chip
  }

  pub fn touch_mode(&self) -> TouchMode {
    self.touch_mode
  }

  /// Slot bookkeeping as last delivered to the input sink.
  pub fn tracker(&self) -> &Tracker {
    &self.tracker
  }

  /// Latest raw frame captured by a diagnostic read or a raw-mode poll.
  pub fn raw(&self) -> &RawCapture {
    &self.raw
  }

  /// Give back the owned peripherals.
  pub fn release(self) -> (I, B, S, D) {
    (self.i2c, self.board, self.sink, self.delay)
  }
}

impl<I, E, B, S, D> Bt532<I, B, S, D>
where
  I: I2c<SevenBitAddress, Error = E>,
  B: Board,
  S: InputSink,
  D: DelayNs,
{
  /// Stage new host flags; they reach the device on the next poll or init.
  pub(crate) fn stage_optional_mode(&mut self, flags: OptionalMode) {
    self.optional.desired = flags;
  }

  /// Write the optional-mode register when the staged value changed.
  pub(crate) async fn sync_optional_mode(&mut self, force: bool) -> Result<(), Error<E>> {
    let value = self.optional.desired.merged(self.optional.base);
    if !force && self.optional.written == Some(value) {
      return Ok(());
    }
    self.write_u16(defs::Reg::OptionalMode, value).await?;
    debug!("optional mode {:#x}", value);
    self.optional.written = Some(value);
    Ok(())
  }

  /// Drop all contacts and buttons, telling the sink about each release.
  pub(crate) fn clear_reports(&mut self) {
    self.tracker.release_all(&mut self.sink);
  }
}
