use bitfield_struct::bitfield;

/// Board-level description of the panel wired to the controller.
///
/// The configuration is plain data and is only consulted by the driver, so it
/// can be built in a `const` context:
///
/// ```no_run
/// use bt532::{Config, Orientation};
///
/// static FIRMWARE: &[u8] = include_bytes!("zt7554.bin");
///
/// const CONFIG: Config = Config::new(720, 1280)
///   .with_orientation(Orientation::new().with_v_flip(true))
///   .with_buttons(2)
///   .with_firmware(FIRMWARE)
///   .with_watchdog(Some(3));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Config {
  pub x_resolution: u16,
  pub y_resolution: u16,
  pub orientation: Orientation,
  /// Number of capacitive keys, `0` when the panel has none.
  pub buttons: u8,
  pub firmware: Option<&'static [u8]>,
  pub chip_name: &'static str,
  /// Report palm contacts with the extended 8-byte coordinate records.
  pub palm_reporting: bool,
  /// Watchdog interval in seconds, `None` disables self-recovery.
  pub watchdog: Option<u8>,
}

impl Config {
  pub const fn new(x_resolution: u16, y_resolution: u16) -> Self {
    Self {
      x_resolution,
      y_resolution,
      orientation: Orientation::new(),
      buttons: 0,
      firmware: None,
      chip_name: "ZT7554",
      palm_reporting: true,
      watchdog: Some(3),
    }
  }

  pub const fn with_orientation(mut self, orientation: Orientation) -> Self {
    self.orientation = orientation;
    self
  }

  pub const fn with_buttons(mut self, buttons: u8) -> Self {
    self.buttons = if buttons as usize > crate::MAX_BUTTONS { crate::MAX_BUTTONS as u8 } else { buttons };
    self
  }

  pub const fn with_firmware(mut self, image: &'static [u8]) -> Self {
    self.firmware = Some(image);
    self
  }

  pub const fn with_chip_name(mut self, name: &'static str) -> Self {
    self.chip_name = name;
    self
  }

  pub const fn with_palm_reporting(mut self, enabled: bool) -> Self {
    self.palm_reporting = enabled;
    self
  }

  pub const fn with_watchdog(mut self, seconds: Option<u8>) -> Self {
    self.watchdog = match seconds {
      Some(0) => None,
      other => other,
    };
    self
  }

  pub(crate) const fn has_buttons(&self) -> bool {
    self.buttons > 0
  }

  /// Register value of the point touch mode for this panel.
  pub(crate) const fn point_mode(&self) -> u16 {
    if self.palm_reporting {
      2
    } else {
      0
    }
  }

  pub(crate) const fn coord_size(&self) -> usize {
    if self.palm_reporting {
      crate::defs::COORD_SIZE_PALM
    } else {
      crate::defs::COORD_SIZE
    }
  }

  pub(crate) const fn point_record_size(&self) -> usize {
    crate::defs::POINT_HEADER_SIZE + crate::MAX_FINGERS * self.coord_size()
  }
}

impl Default for Config {
  fn default() -> Self {
    Self::new(720, 1280)
  }
}

/// Mapping from sensor axes to screen axes. Flips apply before the swap.
#[bitfield(u8, defmt = cfg(feature = "defmt"))]
#[derive(PartialEq, Eq)]
pub struct Orientation {
  pub v_flip: bool,
  pub h_flip: bool,
  pub xy_swap: bool,
  #[bits(5)]
  __: u8,
}

/// Reporting mode of the controller.
///
/// `Point` is the normal coordinate mode; the others stream raw sensor data
/// alongside the point record and exist for panel diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TouchMode {
  Point,
  Normal,
  Delta,
  Dnd,
  Reference,
  Pdnd,
  /// Factory alias for [`TouchMode::Point`].
  Sec,
}

impl TouchMode {
  pub(crate) const fn register_value(self, config: &Config) -> u16 {
    match self {
      TouchMode::Point | TouchMode::Sec => config.point_mode(),
      TouchMode::Normal => 5,
      TouchMode::Delta => 3,
      TouchMode::Dnd => 6,
      TouchMode::Reference => 10,
      TouchMode::Pdnd => 11,
    }
  }

  /// Collapse aliases so state comparisons are meaningful.
  pub(crate) const fn canonical(self) -> Self {
    match self {
      TouchMode::Sec => TouchMode::Point,
      other => other,
    }
  }

  pub const fn is_point(self) -> bool {
    matches!(self.canonical(), TouchMode::Point)
  }

  pub(crate) const fn is_dnd(self) -> bool {
    matches!(self, TouchMode::Dnd | TouchMode::Pdnd)
  }
}
