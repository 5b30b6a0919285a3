/******************************************************************************
 * Zinitix BT532 / ZT75xx register map, command codes and timing constants.   *
 * ========================================================================== *
 * Registers are 16-bit, addressed little-endian on the wire. Values are      *
 * little-endian u16 unless noted otherwise.                                  *
*******************************************************************************/

use bitfield_struct::bitfield;

pub(crate) const I2C_ADDR: u8 = 0x20;

/// Number of simultaneous contacts tracked by the controller.
pub const MAX_FINGERS: usize = 10;
/// Number of capacitive keys the icon register can describe.
pub const MAX_BUTTONS: usize = 8;
/// Upper bound for `x_nodes * y_nodes` on supported parts.
pub const MAX_RAW_NODES: usize = 792;

pub(crate) const COORD_SIZE: usize = 6;
pub(crate) const COORD_SIZE_PALM: usize = 8;
pub(crate) const POINT_HEADER_SIZE: usize = 4;
/// Largest point-status record, used to size buffers.
pub const POINT_RECORD_MAX: usize = POINT_HEADER_SIZE + MAX_FINGERS * COORD_SIZE_PALM;
/// Capacity of the raw capture buffer: every node as u16 plus a status record.
pub const RAW_CAPTURE_CAPACITY: usize = MAX_RAW_NODES * 2 + POINT_RECORD_MAX;

pub(crate) const CHECKSUM_VALID: u16 = 0x55AA;
pub(crate) const SCAN_RATE_HZ: u16 = 100;
pub(crate) const RAW_HOST_DELAY: u16 = 100;
pub(crate) const CALIBRATION_MODE: u16 = 0x07;
pub(crate) const INT_DRAIN_COUNT: usize = 10;
pub(crate) const FORCED_UPGRADE_VERSION: u16 = 0xFF;

pub(crate) const DND_N_COUNT: u16 = 12;
pub(crate) const DND_U_COUNT: u16 = 12;
pub(crate) const DND_FREQUENCY: u16 = 79;

pub(crate) const PALM_REPORT_WIDTH: u8 = 200;
pub(crate) const PALM_REJECT_WIDTH: u8 = 255;
pub(crate) const PALM_MAJOR_OFFSET: u8 = 40;

pub(crate) const SECTOR_SIZE: usize = 8;
pub(crate) const MAX_WRITE_PAYLOAD: usize = 8;

// Firmware image header offsets.
pub(crate) const IMAGE_VERSION_OFFSET: usize = 52;
pub(crate) const IMAGE_MINOR_OFFSET: usize = 56;
pub(crate) const IMAGE_DATA_VERSION_OFFSET: usize = 60;

// Bus timing.
pub(crate) const BUS_RETRIES: usize = 8;
pub(crate) const BUS_RETRY_BACKOFF_MS: u32 = 1;
pub(crate) const TRANSACTION_SETUP_US: u32 = 50;
pub(crate) const RAW_SETUP_US: u32 = 200;
pub(crate) const FLASH_SETUP_US: u32 = 1_000;
pub(crate) const POST_TRANSACTION_US: u32 = 10;

// Power timing.
pub(crate) const CHIP_OFF_DELAY_MS: u32 = 50;
pub(crate) const CHIP_ON_DELAY_MS: u32 = 200;
pub(crate) const FIRMWARE_ON_DELAY_MS: u32 = 150;
pub(crate) const BRINGUP_STEP_US: u32 = 10;
pub(crate) const NVM_INIT_DELAY_MS: u32 = 2;
pub(crate) const BRINGUP_RETRIES: usize = 3;

// Flash timing.
pub(crate) const UPGRADE_POWER_SETTLE_MS: u32 = 10;
pub(crate) const UPGRADE_NVM_SETTLE_MS: u32 = 5;
pub(crate) const ERASE_SETTLE_MS: u32 = 20;
pub(crate) const SECTOR_DELAY_US: u32 = 100;
pub(crate) const PAGE_FUSE_DELAY_MS: u32 = 8;
pub(crate) const UPGRADE_ATTEMPTS: usize = 2;

// Calibration and save timing.
pub(crate) const CALIBRATION_POLLS: usize = 10;
pub(crate) const CALIBRATION_REISSUE_POLL: usize = 5;
pub(crate) const CALIBRATION_POLL_MS: u32 = 200;
pub(crate) const NVM_BRACKET_US: u32 = 100;
pub(crate) const SAVE_CALIBRATION_MS: u32 = 700;
pub(crate) const SAVE_STATUS_MS: u32 = 1_000;
pub(crate) const CLEAR_REFERENCE_MS: u32 = 500;

// Diagnostic timing.
pub(crate) const MODE_SETTLE_MS: u32 = 20;
pub(crate) const IRQ_POLL_MS: u32 = 1;
pub(crate) const IRQ_POLL_LIMIT: usize = 1_000;
pub(crate) const BUTTON_SETTLE_US: u32 = 100;

#[allow(dead_code)]
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Reg {
  // Configuration (0x0010..0x0020)
  TouchMode = 0x0010,
  ChipRevision = 0x0011,
  FirmwareVersion = 0x0012,
  DataVersion = 0x0013,
  HwId = 0x0014,
  SupportedFingers = 0x0015,
  EepromInfo = 0x0018,
  InitialTouchMode = 0x0019,
  VendorId = 0x001C,
  Threshold = 0x0020,

  // Sensor geometry
  TotalX = 0x0060,
  TotalY = 0x0061,
  DelayRawForHost = 0x007F,

  // Reports
  PointStatus = 0x0080,
  IconStatus = 0x00AA,

  // Keys
  ButtonCount = 0x00B0,
  ButtonSensitivity = 0x00B2,
  DummyButtonSensitivity = 0x00C8,

  // Resolution and interrupts
  XResolution = 0x00C0,
  YResolution = 0x00C1,
  IntEnable = 0x00F0,
  PeriodicInterval = 0x00F1,

  // Analog front end
  AfeFrequency = 0x0100,
  OptionalMode = 0x011F,
  MinorVersion = 0x0121,
  NCount = 0x0122,
  Shift = 0x012B,
  Checksum = 0x012C,
  UCount = 0x0135,

  // Bulk data
  RawData = 0x0200,

  // Flash access
  WriteFlash = 0x01D1,
  ReadFlash = 0x01D2,

  // Vendor command page
  VendorEnable = 0xC000,
  ProgramStart = 0xC001,
  NvmInit = 0xC002,
  NvmVpp = 0xC003,
  WriteProtect = 0xC104,
  EraseSetup = 0xC108,
  EraseAddr0 = 0xC109,
  EraseAddr1 = 0xC10A,
  ChipCode = 0xCC00,
}

impl From<Reg> for u16 {
  fn from(reg: Reg) -> Self {
    reg as u16
  }
}

/// Write-only registers that act on the address phase alone.
#[allow(dead_code)]
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Cmd {
  SoftwareReset = 0x0000,
  Wakeup = 0x0001,
  ClearInt = 0x0003,
  Idle = 0x0004,
  Sleep = 0x0005,
  Calibrate = 0x0006,
  SaveStatus = 0x0007,
  SaveCalibration = 0x0008,
  RecallFactory = 0x000F,
  InitFlash = 0x01D0,
  VendorClearInt = 0xC004,
  MassErase = 0xC10B,
}

impl From<Cmd> for u16 {
  fn from(cmd: Cmd) -> Self {
    cmd as u16
  }
}

/// Controller silicon, identified by the chip code read during bring-up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Chip {
  Zt7554,
  Zt7548,
  Bt43x,
  Unknown(u16),
}

impl Chip {
  pub const fn from_code(code: u16) -> Self {
    match code {
      0xE700 => Chip::Zt7554,
      0xE548 => Chip::Zt7548,
      0xE200 => Chip::Bt43x,
      other => Chip::Unknown(other),
    }
  }

  /// Size of the on-chip firmware flash.
  pub const fn flash_size(self) -> usize {
    match self {
      Chip::Zt7554 => 64 * 1024,
      Chip::Zt7548 => 48 * 1024,
      Chip::Bt43x => 24 * 1024,
      Chip::Unknown(_) => 32 * 1024,
    }
  }

  /// Number of bytes fused together by one program page.
  pub const fn page_size(self) -> usize {
    match self {
      Chip::Zt7548 | Chip::Bt43x => 64,
      _ => 128,
    }
  }
}

impl Default for Chip {
  fn default() -> Self {
    Chip::Unknown(0)
  }
}

/// Status word at the head of every point record.
#[bitfield(u16, defmt = cfg(feature = "defmt"))]
#[derive(PartialEq, Eq)]
pub struct PointStatus {
  pub count_change: bool,
  pub down: bool,
  pub moved: bool,
  pub up: bool,
  pub palm: bool,
  pub palm_reject: bool,
  #[bits(2)]
  __: u8,
  pub weight_change: bool,
  pub no_change: bool,
  pub reject: bool,
  pub exist: bool,
  ___: bool,
  pub must_zero: bool,
  pub debug: bool,
  pub icon_event: bool,
}

impl PointStatus {
  /// Words the controller emits when it lost its configuration.
  pub(crate) fn is_reset_marker(self) -> bool {
    matches!(self.into_bits(), 0xFFFF | 0x0001)
  }
}

/// Per-slot flags inside a point record.
#[bitfield(u8, defmt = cfg(feature = "defmt"))]
#[derive(PartialEq, Eq)]
pub struct SubStatus {
  pub exist: bool,
  pub down: bool,
  pub moved: bool,
  pub up: bool,
  pub update: bool,
  pub wait: bool,
  #[bits(2)]
  __: u8,
}

/// Key transitions latched in the icon register.
#[bitfield(u16, defmt = cfg(feature = "defmt"))]
#[derive(PartialEq, Eq)]
pub struct IconStatus {
  pub down: u8,
  pub up: u8,
}

#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub(crate) struct EepromInfo {
  pub(crate) needs_calibration: bool,
  #[bits(15)]
  __: u16,
}

/// Host-driven operating flags mirrored into the optional-mode register.
#[bitfield(u16, defmt = cfg(feature = "defmt"))]
#[derive(PartialEq, Eq)]
pub struct OptionalMode {
  __: bool,
  pub charger: bool,
  pub cover: bool,
  #[bits(13)]
  ___: u16,
}

impl OptionalMode {
  pub(crate) const MASK: u16 = 0b110;

  /// Merge the host flags into the vendor base value read at init.
  pub(crate) fn merged(self, base: u16) -> u16 {
    (base & !Self::MASK) | self.into_bits()
  }
}

pub(crate) fn interrupt_mask(palm: bool, buttons: bool) -> u16 {
  PointStatus::new()
    .with_count_change(true)
    .with_down(true)
    .with_moved(true)
    .with_up(true)
    .with_palm(palm)
    .with_palm_reject(palm)
    .with_icon_event(buttons)
    .into_bits()
}
