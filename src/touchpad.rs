//! Slot bookkeeping that turns point-status snapshots into touch events.
//!
//! Every poll is reduced against the slots last delivered to the
//! [`InputSink`]. The sink only ever sees edges:
//!
//! - `Contact` with [`TouchPhase::Down`] when a slot appears
//! - `Contact` with [`TouchPhase::Move`] when a reported slot changes position
//! - `Lift` when a reported slot vanishes
//! - `Touching` when the number of active fingers leaves or reaches zero
//!
//! Each poll that produced anything ends with `Sync`.

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};

use crate::defs::*;
use crate::{Board, Bt532, Config, Error, InputSink, PointRecord, TouchSlot};

/// Events delivered to the [`InputSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InputEvent {
  Button { index: u8, pressed: bool },
  Contact(Contact),
  Lift { slot: u8 },
  /// Any finger on the panel.
  Touching(bool),
  /// End of one coherent batch of events.
  Sync,
}

/// Indicates how a finger changed compared to the last report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TouchPhase {
  /// A new finger contact appeared on the surface.
  Down,
  /// A reported finger moved.
  Move,
}

impl TouchPhase {
  pub const fn is_down(self) -> bool {
    matches!(self, TouchPhase::Down)
  }

  pub const fn is_move(self) -> bool {
    matches!(self, TouchPhase::Move)
  }
}

/// Screen-space description of one finger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Contact {
  pub slot: u8,
  pub phase: TouchPhase,
  pub x: u16,
  pub y: u16,
  pub touch_major: u8,
  pub pressure: u8,
  pub width_major: u8,
  pub touch_minor: u8,
  pub palm: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ButtonState {
  #[default]
  Unchanged,
  Pressed,
  Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Palm {
  Report,
  Reject,
}

/// Last-reported slots and buttons, plus the active-finger counter.
///
/// The counter always equals the number of last-reported slots that exist.
#[derive(Debug, Clone)]
pub struct Tracker {
  reported: [TouchSlot; MAX_FINGERS],
  buttons: [ButtonState; MAX_BUTTONS],
  button_count: u8,
  active: u8,
}

impl Tracker {
  pub fn new(button_count: u8) -> Self {
    Self {
      reported: [TouchSlot::default(); MAX_FINGERS],
      buttons: [ButtonState::default(); MAX_BUTTONS],
      button_count: button_count.min(MAX_BUTTONS as u8),
      active: 0,
    }
  }

  pub fn active_fingers(&self) -> u8 {
    self.active
  }

  /// Last-reported copy of `slot`, if that finger is down.
  pub fn slot(&self, slot: usize) -> Option<&TouchSlot> {
    self.reported.get(slot).filter(|slot| slot.is_present())
  }

  pub fn button(&self, index: usize) -> ButtonState {
    self.buttons.get(index).copied().unwrap_or_default()
  }

  /// Forget everything without telling the sink.
  pub(crate) fn reset(&mut self) {
    *self = Self::new(self.button_count);
  }

  /// Reduce one validated, non-spurious snapshot against the last report.
  ///
  /// Returns whether a button transitioned.
  pub(crate) fn reduce(
    &mut self,
    record: &PointRecord,
    icon: IconStatus,
    config: &Config,
    sink: &mut impl InputSink,
  ) -> bool {
    let mut button_event = false;
    let count = self.button_count as usize;
    for (index, state) in self.buttons[..count].iter_mut().enumerate() {
      if icon.down() & (1 << index) != 0 {
        *state = ButtonState::Pressed;
        sink.report(InputEvent::Button { index: index as u8, pressed: true });
        button_event = true;
      }
    }
    for (index, state) in self.buttons[..count].iter_mut().enumerate() {
      if icon.up() & (1 << index) != 0 {
        *state = ButtonState::Released;
        sink.report(InputEvent::Button { index: index as u8, pressed: false });
        button_event = true;
      }
    }

    if button_event || !record.status.exist() {
      self.lift_all(sink);
      sink.report(InputEvent::Sync);
      return button_event;
    }

    let palm = if record.status.palm_reject() {
      Some(Palm::Reject)
    } else if record.status.palm() {
      Some(Palm::Report)
    } else {
      None
    };

    for (index, current) in record.slots.iter().enumerate() {
      let previous = self.reported[index];
      if current.is_present() {
        let Some((x, y)) = transform(current.x, current.y, config) else {
          warn!("slot {} out of range: {}, {}", index, current.x, current.y);
          continue;
        };
        let next = TouchSlot { x, y, width: touch_width(current.width, palm), ..*current };
        if let Some(phase) = classify_transition(&previous, &next) {
          sink.report(InputEvent::Contact(contact(index, phase, &next, palm)));
          if phase.is_down() {
            self.active += 1;
            if self.active == 1 {
              sink.report(InputEvent::Touching(true));
            }
          }
        }
        self.reported[index] = next;
      } else if current.sub_status.up() || previous.is_present() {
        if previous.is_present() {
          self.lift(index, sink);
        }
        self.reported[index] = TouchSlot::default();
      }
    }

    sink.report(InputEvent::Sync);
    false
  }

  /// Release every button and finger, announcing each release.
  pub(crate) fn release_all(&mut self, sink: &mut impl InputSink) {
    let mut reported = false;
    let count = self.button_count as usize;
    for (index, state) in self.buttons[..count].iter_mut().enumerate() {
      if *state == ButtonState::Pressed {
        sink.report(InputEvent::Button { index: index as u8, pressed: false });
        reported = true;
      }
      *state = ButtonState::Unchanged;
    }
    reported |= self.active > 0;
    self.lift_all(sink);
    if reported {
      sink.report(InputEvent::Sync);
    }
  }

  fn lift_all(&mut self, sink: &mut impl InputSink) {
    for index in 0..MAX_FINGERS {
      if self.reported[index].is_present() {
        self.lift(index, sink);
      }
    }
    self.reported = [TouchSlot::default(); MAX_FINGERS];
  }

  fn lift(&mut self, index: usize, sink: &mut impl InputSink) {
    sink.report(InputEvent::Lift { slot: index as u8 });
    self.reported[index] = TouchSlot::default();
    if self.active > 0 {
      self.active -= 1;
      if self.active == 0 {
        sink.report(InputEvent::Touching(false));
      }
    }
  }
}

impl<I, E, B, S, D> Bt532<I, B, S, D>
where
  I: I2c<SevenBitAddress, Error = E>,
  B: Board,
  S: InputSink,
  D: DelayNs,
{
  /// Service one interrupt: read, validate and reduce a snapshot.
  ///
  /// A bad snapshot restarts the controller instead of producing events.
  pub(crate) async fn service_interrupt(&mut self) -> Result<(), Error<E>> {
    if !self.board.irq_asserted() {
      trace!("interrupt line idle, ignoring edge");
      return Ok(());
    }

    let record = match self.read_point_record().await {
      Ok(record) => record,
      Err(_) => {
        warn!("bad point record, restarting controller");
        return self.restart().await;
      }
    };

    if self.touch_mode.is_point() {
      self.sync_optional_mode(false).await?;
    }
    self.clear_interrupt().await?;

    if record.is_spurious() {
      trace!("spurious interrupt");
      return Ok(());
    }

    let mut icon = IconStatus::new();
    if self.config.has_buttons() && record.status.icon_event() {
      icon = match self.read_as(Reg::IconStatus).await {
        Ok(icon) => icon,
        Err(e) => {
          warn!("button status read failed");
          if self.clear_interrupt().await.is_err() {
            warn!("clear interrupt failed");
          }
          return Err(e);
        }
      };
    }

    if self.tracker.reduce(&record, icon, &self.config, &mut self.sink) {
      self.delay.delay_us(BUTTON_SETTLE_US).await;
    }
    Ok(())
  }
}

fn classify_transition(previous: &TouchSlot, current: &TouchSlot) -> Option<TouchPhase> {
  match (previous.is_present(), current.is_present()) {
    (false, true) => Some(TouchPhase::Down),
    (true, true) if (previous.x, previous.y) != (current.x, current.y) => Some(TouchPhase::Move),
    _ => None,
  }
}

/// Map sensor coordinates to the screen. Flips apply before the swap; a
/// result outside the screen is rejected.
fn transform(x: u16, y: u16, config: &Config) -> Option<(u16, u16)> {
  let orientation = config.orientation;
  let (mut x, mut y) = (i32::from(x), i32::from(y));
  let (mut max_x, mut max_y) = (i32::from(config.x_resolution), i32::from(config.y_resolution));

  if orientation.v_flip() {
    y = max_y - y;
  }
  if orientation.h_flip() {
    x = max_x - x;
  }
  if orientation.xy_swap() {
    core::mem::swap(&mut x, &mut y);
    core::mem::swap(&mut max_x, &mut max_y);
  }

  if !(0..=max_x).contains(&x) || !(0..=max_y).contains(&y) {
    return None;
  }
  Some((x as u16, y as u16))
}

fn touch_width(width: u8, palm: Option<Palm>) -> u8 {
  match palm {
    Some(Palm::Report) => PALM_REPORT_WIDTH,
    Some(Palm::Reject) => PALM_REJECT_WIDTH,
    None if width >= PALM_REPORT_WIDTH => PALM_REPORT_WIDTH - 10,
    None => width.max(1),
  }
}

fn contact(index: usize, phase: TouchPhase, slot: &TouchSlot, palm: Option<Palm>) -> Contact {
  let width_major = match palm {
    Some(Palm::Report) => slot.width - PALM_MAJOR_OFFSET,
    _ => slot.width,
  };
  Contact {
    slot: index as u8,
    phase,
    x: slot.x,
    y: slot.y,
    touch_major: slot.width,
    pressure: slot.width,
    width_major,
    touch_minor: slot.minor_width,
    palm: palm.is_some(),
  }
}
