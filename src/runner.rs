use core::cell::{Cell, RefCell};
use core::pin::pin;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};

use crate::{
  Arbiter, Board, Bt532, Calibration, Capabilities, Error, InputSink, RawCapture, SessionState, TouchMode,
};

/// Interrupts queued beyond this depth are dropped.
pub const IRQ_QUEUE_DEPTH: usize = 4;

/// Host conditions mirrored into the controller's optional-mode register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OptionalFlag {
  Charger,
  Cover,
}

enum Request {
  Interrupt,
  /// Commands carry a sequence number that the reply echoes back.
  Command(u32, Command),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Command {
  EarlySuspend,
  Suspend,
  Resume,
  Teardown,
  SetTouchMode(TouchMode),
  CaptureRaw(usize),
  Upgrade(&'static [u8]),
  ReadRegister(u16),
  WriteRegister(u16, u16),
  Calibrate,
  SaveStatus,
  ClearReference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
  Done,
  Register(u16),
  Captured(usize),
  Calibrated(Calibration),
}

/// State shared between the [`Runner`] and every [`Handle`].
///
/// Construct it in a `static` and hand out handles with [`Shared::handle`].
pub struct Shared<M: RawMutex, E> {
  arbiter: Arbiter<M>,
  requests: Channel<M, Request, IRQ_QUEUE_DEPTH>,
  reply: Signal<M, (u32, Result<Reply, Error<E>>)>,
  callers: Mutex<M, ()>,
  sequence: BlockingMutex<M, Cell<u32>>,
  caps: BlockingMutex<M, Cell<Option<Capabilities>>>,
  raw: BlockingMutex<M, RefCell<RawCapture>>,
}

impl<M: RawMutex, E> Shared<M, E> {
  pub const fn new() -> Self {
    Self {
      arbiter: Arbiter::new(),
      requests: Channel::new(),
      reply: Signal::new(),
      callers: Mutex::new(()),
      sequence: BlockingMutex::new(Cell::new(0)),
      caps: BlockingMutex::new(Cell::new(None)),
      raw: BlockingMutex::new(RefCell::new(RawCapture::new())),
    }
  }

  pub fn handle(&self) -> Handle<'_, M, E> {
    Handle { shared: self }
  }

  pub fn arbiter(&self) -> &Arbiter<M> {
    &self.arbiter
  }

  fn publish(&self, caps: Option<Capabilities>) {
    self.caps.lock(|cell| cell.set(caps));
  }
}

impl<M: RawMutex, E> Default for Shared<M, E> {
  fn default() -> Self {
    Self::new()
  }
}

/// Cheap front-end for interrupt handlers and command issuers.
pub struct Handle<'a, M: RawMutex, E> {
  shared: &'a Shared<M, E>,
}

impl<M: RawMutex, E> Clone for Handle<'_, M, E> {
  fn clone(&self) -> Self {
    *self
  }
}

impl<M: RawMutex, E> Copy for Handle<'_, M, E> {}

impl<'a, M: RawMutex, E> Handle<'a, M, E> {
  /// Queue a poll of the controller. Never blocks and never touches the bus.
  ///
  /// The interrupt is dropped when interrupts are disabled, when another
  /// session holds the device, or when the queue is full.
  pub fn handle_interrupt(&self) {
    if !self.shared.arbiter.accepts_interrupt() {
      trace!("interrupt ignored, device busy");
      return;
    }
    if self.shared.requests.try_send(Request::Interrupt).is_err() {
      trace!("interrupt queue full");
    }
  }

  pub fn state(&self) -> SessionState {
    self.shared.arbiter.state()
  }

  pub fn capabilities(&self) -> Option<Capabilities> {
    self.shared.caps.lock(|cell| cell.get())
  }

  /// Record a charger or cover change; it reaches the controller with the
  /// next poll or reinitialisation.
  pub fn set_optional_flag(&self, flag: OptionalFlag, on: bool) {
    self.shared.arbiter.update_optional_mode(|mode| match flag {
      OptionalFlag::Charger => mode.with_charger(on),
      OptionalFlag::Cover => mode.with_cover(on),
    });
  }

  pub async fn set_touch_mode(&self, mode: TouchMode) -> Result<(), Error<E>> {
    self.request(SessionState::ModeSwitch, Command::SetTouchMode(mode)).await.map(drop)
  }

  /// Capture one raw frame into `buf`, dropping `skip` frames first.
  pub async fn capture_raw(&self, buf: &mut [u8], skip: usize) -> Result<usize, Error<E>> {
    let caps = self.capabilities().ok_or(Error::NotReady)?;
    if buf.len() < caps.nodes() * 2 {
      return Err(Error::BufferOverflow);
    }
    let Reply::Captured(len) = self.request(SessionState::CaptureRaw, Command::CaptureRaw(skip)).await? else {
      unreachable!("raw capture answered with another reply")
    };
    self.shared.raw.lock(|raw| {
      let raw = raw.borrow();
      buf[..len].copy_from_slice(&raw.as_slice()[..len]);
    });
    Ok(len)
  }

  /// Flash `image`, then run a full cold init with the new firmware.
  pub async fn upgrade_firmware(&self, image: &'static [u8]) -> Result<(), Error<E>> {
    self.request(SessionState::Upgrading, Command::Upgrade(image)).await.map(drop)
  }

  pub async fn read_register(&self, addr: u16) -> Result<u16, Error<E>> {
    let Reply::Register(value) = self.request(SessionState::ModeSwitch, Command::ReadRegister(addr)).await? else {
      unreachable!("register read answered with another reply")
    };
    Ok(value)
  }

  pub async fn write_register(&self, addr: u16, value: u16) -> Result<(), Error<E>> {
    self.request(SessionState::ModeSwitch, Command::WriteRegister(addr, value)).await.map(drop)
  }

  pub async fn calibrate(&self) -> Result<Calibration, Error<E>> {
    let Reply::Calibrated(outcome) = self.request(SessionState::Calibrating, Command::Calibrate).await? else {
      unreachable!("calibration answered with another reply")
    };
    Ok(outcome)
  }

  pub async fn save_status(&self) -> Result<(), Error<E>> {
    self.request(SessionState::Calibrating, Command::SaveStatus).await.map(drop)
  }

  pub async fn clear_reference(&self) -> Result<(), Error<E>> {
    self.request(SessionState::Calibrating, Command::ClearReference).await.map(drop)
  }

  /// Power down for a display blank; waits for the running session.
  pub async fn early_suspend(&self) -> Result<(), Error<E>> {
    self.quiesce();
    let guard = self.shared.arbiter.enter(SessionState::EarlySuspend).await?;
    let result = self.exchange(Command::EarlySuspend).await;
    guard.hold(SessionState::EarlySuspend);
    result.map(drop)
  }

  pub async fn suspend(&self) -> Result<(), Error<E>> {
    self.quiesce();
    let guard = self.shared.arbiter.enter(SessionState::Suspended).await?;
    let result = self.exchange(Command::Suspend).await;
    guard.hold(SessionState::Suspended);
    result.map(drop)
  }

  pub async fn resume(&self) -> Result<(), Error<E>> {
    self.wake(SessionState::Resuming).await
  }

  pub async fn late_resume(&self) -> Result<(), Error<E>> {
    self.wake(SessionState::LateResume).await
  }

  /// Stop the runner and power the controller down for good.
  pub async fn teardown(&self) -> Result<(), Error<E>> {
    self.quiesce();
    let guard = self.shared.arbiter.enter(SessionState::Removing).await?;
    let result = self.exchange(Command::Teardown).await;
    guard.hold(SessionState::Removing);
    result.map(drop)
  }

  fn quiesce(&self) {
    self.shared.arbiter.set_irq_enabled(false);
    self.shared.arbiter.set_watchdog_enabled(false);
  }

  async fn wake(&self, state: SessionState) -> Result<(), Error<E>> {
    let guard = self.shared.arbiter.enter(state).await?;
    let result = self.exchange(Command::Resume).await;
    self.shared.arbiter.set_irq_enabled(true);
    self.shared.arbiter.set_watchdog_enabled(true);
    drop(guard);
    result.map(drop)
  }

  async fn request(&self, state: SessionState, command: Command) -> Result<Reply, Error<E>> {
    let _guard = self.shared.arbiter.try_enter(state).ok_or(Error::Busy)?;
    self.exchange(command).await
  }

  /// Queue `command` and wait for its reply.
  ///
  /// A caller that gave up on an earlier command leaves its reply behind;
  /// replies to any sequence number but ours are discarded.
  async fn exchange(&self, command: Command) -> Result<Reply, Error<E>> {
    let _caller = self.shared.callers.lock().await;
    let seq = self.shared.sequence.lock(|seq| {
      seq.set(seq.get().wrapping_add(1));
      seq.get()
    });
    self.shared.requests.send(Request::Command(seq, command)).await;
    loop {
      let (answered, result) = self.shared.reply.wait().await;
      if answered == seq {
        return result;
      }
      debug!("discarding reply to abandoned command {}", answered);
    }
  }
}

/// What serving one request means for the watchdog countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Served {
  Continue,
  Rearm,
  Stop,
}

/// Task that owns the controller and serialises all access to it.
pub struct Runner<'a, M: RawMutex, E, I, B, S, D, T> {
  shared: &'a Shared<M, E>,
  device: Bt532<I, B, S, D>,
  timer: T,
  watchdog_armed: bool,
}

impl<'a, M, E, I, B, S, D, T> Runner<'a, M, E, I, B, S, D, T>
where
  M: RawMutex,
  I: I2c<SevenBitAddress, Error = E>,
  B: Board,
  S: InputSink,
  D: DelayNs,
  T: DelayNs + Clone,
{
  pub fn new(shared: &'a Shared<M, E>, device: Bt532<I, B, S, D>, timer: T) -> Self {
    Self { shared, device, timer, watchdog_armed: false }
  }

  pub fn device(&self) -> &Bt532<I, B, S, D> {
    &self.device
  }

  /// Power up and initialise the controller, then open it for interrupts.
  pub async fn probe(&mut self) -> Result<Capabilities, Error<E>> {
    let arbiter = &self.shared.arbiter;
    if arbiter.state() != SessionState::Probing {
      return Err(Error::InvalidTransition(arbiter.state()));
    }

    self.device.stage_optional_mode(arbiter.optional_mode());
    let caps = self.device.probe().await?;
    self.shared.publish(Some(caps));

    arbiter.release_probe();
    arbiter.set_irq_enabled(true);
    arbiter.set_watchdog_enabled(true);
    self.device.board.enable_irq();
    self.watchdog_armed = true;
    Ok(caps)
  }

  /// Serve interrupts, commands and the watchdog until teardown.
  ///
  /// The watchdog countdown only restarts after a successful poll, a resume,
  /// an upgrade or a recovery attempt; other traffic does not postpone it.
  /// Returns the device once a [`Handle::teardown`] has been processed.
  pub async fn run(mut self) -> Bt532<I, B, S, D> {
    let mut timer = self.timer.clone();
    loop {
      let Some(interval) = self.watchdog_interval_ms() else {
        let request = self.shared.requests.receive().await;
        if self.serve(request).await == Served::Stop {
          return self.device;
        }
        continue;
      };

      let mut tick = pin!(timer.delay_ms(interval));
      loop {
        match select(self.shared.requests.receive(), tick.as_mut()).await {
          Either::First(request) => match self.serve(request).await {
            Served::Stop => return self.device,
            Served::Rearm => break,
            Served::Continue if self.watchdog_interval_ms() != Some(interval) => break,
            Served::Continue => {}
          },
          Either::Second(()) => {
            self.on_watchdog().await;
            break;
          }
        }
      }
    }
  }

  async fn serve(&mut self, request: Request) -> Served {
    let Request::Command(seq, command) = request else {
      let serviced = self.on_interrupt().await;
      return if serviced { Served::Rearm } else { Served::Continue };
    };

    let result = self.execute(command).await;
    self.shared.publish(self.device.capabilities());
    self.shared.reply.signal((seq, result));
    match command {
      Command::Teardown => Served::Stop,
      Command::Resume | Command::Upgrade(_) => Served::Rearm,
      _ => Served::Continue,
    }
  }

  fn watchdog_interval_ms(&self) -> Option<u32> {
    let seconds = self.device.config().watchdog?;
    (self.watchdog_armed && self.shared.arbiter.watchdog_enabled()).then_some(u32::from(seconds) * 1_000)
  }

  /// Returns whether the controller answered a poll.
  async fn on_interrupt(&mut self) -> bool {
    let arbiter = &self.shared.arbiter;
    if !arbiter.irq_enabled() {
      return false;
    }
    let Some(_guard) = arbiter.try_enter(SessionState::Normal) else {
      trace!("interrupt dropped, device busy");
      return false;
    };

    self.device.stage_optional_mode(arbiter.optional_mode());
    let serviced = match self.device.service_interrupt().await {
      Ok(()) => {
        self.watchdog_armed = true;
        true
      }
      Err(_) => {
        warn!("interrupt service failed");
        false
      }
    };
    if !self.device.touch_mode().is_point() {
      self.shared.raw.lock(|raw| raw.borrow_mut().clone_from(self.device.raw()));
    }
    serviced
  }

  async fn on_watchdog(&mut self) {
    let arbiter = &self.shared.arbiter;
    let Some(_guard) = arbiter.try_enter(SessionState::WatchdogRecovery) else {
      debug!("watchdog deferred, device busy");
      return;
    };

    info!("watchdog recovery");
    self.device.stage_optional_mode(arbiter.optional_mode());
    self.device.board.disable_irq();
    if self.device.restart().await.is_err() {
      error!("watchdog recovery failed");
    }
    self.device.board.enable_irq();
    self.shared.publish(self.device.capabilities());
  }

  async fn execute(&mut self, command: Command) -> Result<Reply, Error<E>> {
    debug!("command {}", command);
    self.device.stage_optional_mode(self.shared.arbiter.optional_mode());
    match command {
      Command::EarlySuspend => {
        self.watchdog_armed = false;
        self.device.early_suspend().await?;
      }
      Command::Suspend => {
        self.watchdog_armed = false;
        self.device.suspend().await?;
      }
      Command::Resume => {
        self.watchdog_armed = true;
        self.device.wake().await?;
      }
      Command::Teardown => {
        info!("teardown");
        self.device.shutdown().await?;
      }
      Command::SetTouchMode(mode) => self.device.set_touch_mode(mode).await?,
      Command::CaptureRaw(skip) => {
        let len = self.device.capture_raw(skip).await?;
        self.shared.raw.lock(|raw| raw.borrow_mut().clone_from(self.device.raw()));
        return Ok(Reply::Captured(len));
      }
      Command::Upgrade(image) => {
        self.device.board.disable_irq();
        let result = self.device.reflash(image).await;
        self.device.board.enable_irq();
        self.watchdog_armed = true;
        result?;
      }
      Command::ReadRegister(addr) => return Ok(Reply::Register(self.device.read_register(addr).await?)),
      Command::WriteRegister(addr, value) => self.device.write_register(addr, value).await?,
      Command::Calibrate => {
        self.device.board.disable_irq();
        let result = self.device.calibrate().await;
        self.device.board.enable_irq();
        return Ok(Reply::Calibrated(result?));
      }
      Command::SaveStatus => self.device.save_status().await?,
      Command::ClearReference => self.device.clear_reference().await?,
    }
    Ok(Reply::Done)
  }
}
