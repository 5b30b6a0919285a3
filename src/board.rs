use crate::touchpad::InputEvent;

/// Platform services the controller depends on besides the I²C bus.
///
/// Implementations wrap whatever regulator, GPIO and interrupt controller the
/// board uses. Interrupt delivery itself stays with the platform: its handler
/// forwards to [`crate::Handle::handle_interrupt`].
pub trait Board {
  type Error;

  /// Switch the controller supply rails.
  fn set_power(&mut self, on: bool) -> Result<(), Self::Error>;

  /// Move the controller pins between their active and sleep pin states.
  fn configure_pins(&mut self, active: bool);

  fn enable_irq(&mut self);

  fn disable_irq(&mut self);

  /// Level of the active-low interrupt line.
  fn irq_asserted(&mut self) -> bool;
}

/// Receiver for translated touch events, typically an input subsystem shim.
pub trait InputSink {
  fn report(&mut self, event: InputEvent);
}

impl<S: InputSink + ?Sized> InputSink for &mut S {
  fn report(&mut self, event: InputEvent) {
    (**self).report(event)
  }
}
