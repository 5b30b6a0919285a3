use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};

use crate::defs::*;
use crate::{Board, Bt532, Error, FirmwareImage, InputSink, PowerControl, TouchMode};

/// Static facts about the controller, discovered during cold init.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Capabilities {
  pub vendor_id: u16,
  pub chip_revision: u16,
  pub hw_id: u16,
  pub firmware_version: u16,
  pub minor_version: u16,
  pub data_version: u16,
  pub threshold: u16,
  pub key_threshold: u16,
  pub dummy_key_threshold: u16,
  pub x_nodes: u16,
  pub y_nodes: u16,
  pub n_count: u16,
  pub u_count: u16,
  pub afe_frequency: u16,
  pub shift: u16,
  pub buttons: u8,
  pub fingers: u8,
  pub interrupt_mask: u16,
  pub chip: Chip,
  /// Vendor bits of the optional-mode register, host flags cleared.
  pub internal_flag: u16,
}

impl Capabilities {
  /// Number of sensor nodes, each reported as one u16 in raw frames.
  pub const fn nodes(&self) -> usize {
    self.x_nodes as usize * self.y_nodes as usize
  }

  pub const fn flash_size(&self) -> usize {
    self.chip.flash_size()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum InitState {
  Configure,
  Restart,
  ForceUpgrade,
  LastAttempt,
}

const INIT_RETRIES: usize = 1;

impl<I, E, B, S, D> Bt532<I, B, S, D>
where
  I: I2c<SevenBitAddress, Error = E>,
  B: Board,
  S: InputSink,
  D: DelayNs,
{
  /// Power the controller up and run the full cold init.
  pub(crate) async fn probe(&mut self) -> Result<Capabilities, Error<E>> {
    self.power(PowerControl::OnWithBringup).await?;
    self.tracker.reset();
    self.touch_mode = TouchMode::Point;

    match self.cold_init().await {
      Ok(caps) => {
        info!("{} ready, firmware {:#x}.{:#x} data {:#x}", self.config.chip_name, caps.firmware_version, caps.minor_version, caps.data_version);
        Ok(caps)
      }
      Err(e) => {
        error!("cold init failed");
        if self.power(PowerControl::Off).await.is_err() {
          warn!("power off failed");
        }
        Err(e)
      }
    }
  }

  /// Full initialisation with bounded retries and a forced-upgrade fallback.
  pub(crate) async fn cold_init(&mut self) -> Result<Capabilities, Error<E>> {
    let mut state = InitState::Configure;
    let mut retries = 0;

    loop {
      match state {
        InitState::Configure | InitState::LastAttempt => match self.configure().await {
          Ok(caps) => {
            self.caps = Some(caps);
            return Ok(caps);
          }
          Err(e) if state == InitState::LastAttempt => return Err(e),
          // A bad checksum will not heal by power cycling.
          Err(Error::ChecksumInvalid(sum)) => {
            warn!("checksum {:#x}", sum);
            match self.config.firmware {
              Some(_) => state = InitState::ForceUpgrade,
              None => return Err(Error::ChecksumInvalid(sum)),
            }
          }
          Err(e) if retries >= INIT_RETRIES => match self.config.firmware {
            Some(_) => state = InitState::ForceUpgrade,
            None => return Err(e),
          },
          Err(_) => state = InitState::Restart,
        },

        InitState::Restart => {
          retries += 1;
          warn!("cold init failed, retry {}", retries);
          self.power_cycle().await?;
          state = InitState::Configure;
        }

        InitState::ForceUpgrade => {
          let Some(image) = self.config.firmware else {
            return Err(Error::UpgradeFailed);
          };
          warn!("forcing firmware upgrade");
          self.upgrade(image).await?;
          self.delay.delay_ms(100).await;
          self.calibrate_hardware().await?;
          state = InitState::LastAttempt;
        }
      }
    }
  }

  /// Warm re-init after a fault; falls back to a cold init.
  pub(crate) async fn mini_init(&mut self) -> Result<(), Error<E>> {
    match self.reprogram().await {
      Ok(()) => Ok(()),
      Err(_) => {
        warn!("mini init failed, falling back to cold init");
        self.power_cycle().await?;
        self.cold_init().await.map(|_| ())
      }
    }
  }

  /// Power cycle and reprogram a controller that lost its state.
  pub(crate) async fn restart(&mut self) -> Result<(), Error<E>> {
    self.power_cycle().await?;
    self.clear_reports();
    self.mini_init().await
  }

  /// Host-requested upgrade: flash `image`, then rediscover everything.
  pub(crate) async fn reflash(&mut self, image: &[u8]) -> Result<(), Error<E>> {
    self.clear_reports();
    self.upgrade(image).await?;
    self.touch_mode = TouchMode::Point;
    self.cold_init().await.map(drop)
  }

  async fn reprogram(&mut self) -> Result<(), Error<E>> {
    self.check_checksum().await?;
    self.command(Cmd::SoftwareReset).await?;
    self.program_settings().await
  }

  async fn configure(&mut self) -> Result<Capabilities, Error<E>> {
    let mut eeprom: EepromInfo = match self.read_as(Reg::EepromInfo).await {
      Ok(info) => info,
      Err(_) => {
        self.delay.delay_ms(10).await;
        self.read_as(Reg::EepromInfo).await?
      }
    };
    self.check_checksum().await?;

    self.command(Cmd::SoftwareReset).await?;
    let mask = self.interrupt_mask();
    self.write_u16(Reg::IntEnable, 0).await?;
    self.command(Cmd::SoftwareReset).await?;

    let mut caps = self.discover().await?;
    caps.interrupt_mask = mask;

    if let Some(image) = self.config.firmware.map(FirmwareImage::new) {
      if image.needs_upgrade(&caps) {
        info!("upgrading firmware {:#x} -> {:#x}", caps.firmware_version, image.version().unwrap_or_default());
        self.upgrade(image.as_bytes()).await?;
        self.calibrate_hardware().await?;
        self.write_u16(Reg::IntEnable, 0).await?;
        caps.firmware_version = self.read_u16(Reg::FirmwareVersion).await?;
        caps.minor_version = self.read_u16(Reg::MinorVersion).await?;
        caps.data_version = self.read_u16(Reg::DataVersion).await?;
        caps.chip = self.chip;
        eeprom = self.read_as(Reg::EepromInfo).await?;
      }
    }

    if eeprom.needs_calibration() {
      self.calibrate_hardware().await?;
      self.write_u16(Reg::IntEnable, 0).await?;
    }

    let internal = self.read_u16(Reg::OptionalMode).await?;
    caps.internal_flag = internal & !OptionalMode::MASK;
    self.optional.base = caps.internal_flag;

    self.program_settings().await?;
    debug!("capabilities {}", caps);
    Ok(caps)
  }

  async fn discover(&mut self) -> Result<Capabilities, Error<E>> {
    Ok(Capabilities {
      vendor_id: self.read_u16(Reg::VendorId).await?,
      chip_revision: self.read_u16(Reg::ChipRevision).await?,
      hw_id: self.read_u16(Reg::HwId).await?,
      threshold: self.read_u16(Reg::Threshold).await?,
      key_threshold: self.read_u16(Reg::ButtonSensitivity).await?,
      dummy_key_threshold: self.read_u16(Reg::DummyButtonSensitivity).await?,
      x_nodes: self.read_u16(Reg::TotalX).await?,
      y_nodes: self.read_u16(Reg::TotalY).await?,
      n_count: self.read_u16(Reg::NCount).await?,
      u_count: self.read_u16(Reg::UCount).await?,
      afe_frequency: self.read_u16(Reg::AfeFrequency).await?,
      shift: self.read_u16(Reg::Shift).await?,
      firmware_version: self.read_u16(Reg::FirmwareVersion).await?,
      minor_version: self.read_u16(Reg::MinorVersion).await?,
      data_version: self.read_u16(Reg::DataVersion).await?,
      buttons: self.config.buttons,
      fingers: MAX_FINGERS as u8,
      interrupt_mask: 0,
      chip: self.chip,
      internal_flag: 0,
    })
  }

  async fn check_checksum(&mut self) -> Result<(), Error<E>> {
    let sum = self.read_u16(Reg::Checksum).await?;
    if sum != CHECKSUM_VALID {
      return Err(Error::ChecksumInvalid(sum));
    }
    Ok(())
  }

  /// Registers shared by cold and warm init.
  async fn program_settings(&mut self) -> Result<(), Error<E>> {
    self.write_u16(Reg::XResolution, self.config.x_resolution).await?;
    self.write_u16(Reg::YResolution, self.config.y_resolution).await?;
    if self.config.has_buttons() {
      self.write_u16(Reg::ButtonCount, self.config.buttons as u16).await?;
    }
    self.write_u16(Reg::SupportedFingers, MAX_FINGERS as u16).await?;
    self.write_u16(Reg::InitialTouchMode, self.config.point_mode()).await?;
    self.write_u16(Reg::TouchMode, self.touch_mode.register_value(&self.config)).await?;
    self.sync_optional_mode(true).await?;
    self.write_u16(Reg::IntEnable, self.interrupt_mask()).await?;

    // Drain interrupts latched while the controller was booting.
    for _ in 0..INT_DRAIN_COUNT {
      self.clear_interrupt().await?;
    }

    if !self.touch_mode.is_point() {
      self.write_u16(Reg::DelayRawForHost, RAW_HOST_DELAY).await?;
    }
    if let Some(seconds) = self.config.watchdog {
      self.write_u16(Reg::PeriodicInterval, SCAN_RATE_HZ * seconds as u16).await?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use embassy_futures::block_on;

  use super::*;
  use crate::sim::{self, Op};

  #[test]
  fn cold_init_discovers_and_programs() {
    let mut dev = sim::device();
    dev.i2c.set(0x0060, 18);
    dev.i2c.set(0x0061, 30);
    dev.i2c.set(0x011F, 0x0107);
    let caps = block_on(dev.cold_init()).expect("init");

    assert_eq!(caps.nodes(), 540);
    assert_eq!(caps.interrupt_mask, 0x003F);
    assert_eq!(caps.internal_flag, 0x0101);
    assert_eq!(dev.capabilities(), Some(caps));

    let ops = dev.i2c.ops();
    assert_eq!(&ops[..2], &[Op::Read(0x0018), Op::Read(0x012C)]);
    assert!(ops.contains(&Op::Write(0x00C0, 480)));
    assert!(ops.contains(&Op::Write(0x00C1, 800)));
    assert!(ops.contains(&Op::Write(0x0015, 10)));
    assert!(ops.contains(&Op::Write(0x0019, 2)));
    assert!(ops.contains(&Op::Write(0x011F, 0x0101)));
    assert!(ops.contains(&Op::Write(0x00F1, 300)));
    assert!(!ops.contains(&Op::Write(0x007F, 100)));
    assert_eq!(ops.iter().filter(|op| **op == Op::Cmd(0x0003)).count(), 10);
    assert_eq!(ops.last(), Some(&Op::Write(0x00F1, 300)));
  }

  #[test]
  fn bad_checksum_aborts_before_any_write() {
    let mut dev = sim::device();
    dev.i2c.set(0x012C, 0x1234);
    assert_eq!(block_on(dev.cold_init()), Err(Error::ChecksumInvalid(0x1234)));
    assert_eq!(dev.i2c.ops(), vec![Op::Read(0x0018), Op::Read(0x012C)]);
    assert!(dev.board.power.is_empty());
    assert_eq!(dev.capabilities(), None);
  }

  #[test]
  fn eeprom_read_is_retried_once() {
    let mut dev = sim::device();
    dev.i2c.fail_reads_of(0x0018, 1);
    block_on(dev.cold_init()).expect("init");
    assert!(dev.board.power.is_empty());
  }

  #[test]
  fn bus_failure_power_cycles_and_retries() {
    let mut dev = sim::device();
    dev.i2c.fail_reads_of(0x0060, 1);
    block_on(dev.cold_init()).expect("init");
    assert_eq!(dev.board.power, vec![false, true]);
  }

  #[test]
  fn persistent_failure_without_image_is_surfaced() {
    let mut dev = sim::device();
    dev.i2c.fail_reads_of(0x0060, usize::MAX);
    assert_eq!(block_on(dev.cold_init()), Err(Error::I2c(sim::BusFault)));
    assert_eq!(dev.board.power, vec![false, true]);
  }

  #[test]
  fn bad_checksum_with_image_forces_upgrade() {
    let image = sim::image(64, 0x01, 0, 0);
    let mut dev = sim::device_with(sim::config().with_firmware(image));
    dev.i2c.set(0x012C, 0x1234);
    dev.i2c.heal_checksum_on_upgrade();
    block_on(dev.cold_init()).expect("init after forced upgrade");
    assert_eq!(&dev.i2c.flash()[..64], image);
    assert!(dev.i2c.ops().contains(&Op::Cmd(0x0008)));
  }

  #[test]
  fn newer_image_is_flashed_during_init() {
    let image = sim::image(64, 0x30, 0, 0);
    let mut dev = sim::device_with(sim::config().with_firmware(image));
    dev.i2c.set(0x0012, 0x20);
    dev.i2c.set_version_after_upgrade(0x30);
    let caps = block_on(dev.cold_init()).expect("init");
    assert_eq!(caps.firmware_version, 0x30);
    assert_eq!(&dev.i2c.flash()[..64], image);
  }

  #[test]
  fn current_image_is_not_reflashed() {
    let image = sim::image(64, 0x10, 0, 0);
    let mut dev = sim::device_with(sim::config().with_firmware(image));
    dev.i2c.set(0x0012, 0x10);
    block_on(dev.cold_init()).expect("init");
    assert!(!dev.i2c.ops().contains(&Op::Cmd(0xC10B)));
  }

  #[test]
  fn calibration_flag_triggers_calibration() {
    let mut dev = sim::device();
    dev.i2c.set(0x0018, 0x0001);
    block_on(dev.cold_init()).expect("init");
    assert!(dev.i2c.ops().contains(&Op::Cmd(0x0006)));
  }

  #[test]
  fn raw_mode_sets_host_delay() {
    let mut dev = sim::device();
    dev.touch_mode = TouchMode::Delta;
    block_on(dev.cold_init()).expect("init");
    let ops = dev.i2c.ops();
    assert!(ops.contains(&Op::Write(0x0010, 3)));
    assert!(ops.contains(&Op::Write(0x007F, 100)));
  }

  #[test]
  fn mini_init_skips_discovery() {
    let mut dev = sim::device();
    dev.config.buttons = 2;
    block_on(dev.mini_init()).expect("mini init");
    let ops = dev.i2c.ops();
    assert_eq!(&ops[..2], &[Op::Read(0x012C), Op::Cmd(0x0000)]);
    assert!(ops.contains(&Op::Write(0x00B0, 2)));
    assert!(ops.contains(&Op::Write(0x00F0, 0x803F)));
    assert!(!ops.contains(&Op::Read(0x0060)));
  }

  #[test]
  fn mini_init_escalates_on_bad_checksum() {
    let mut dev = sim::device();
    dev.i2c.set(0x012C, 0x0BAD);
    dev.i2c.heal_checksum_on_bringup();
    block_on(dev.mini_init()).expect("escalated");
    assert_eq!(dev.board.power, vec![false, true]);
    assert!(dev.i2c.ops().contains(&Op::Read(0x0060)));
  }

  #[test]
  fn reflash_returns_to_point_mode() {
    let mut dev = sim::device();
    dev.touch_mode = TouchMode::Delta;
    dev.i2c.set_version_after_upgrade(0x21);
    block_on(dev.reflash(sim::image(64, 0x21, 0, 0))).expect("reflash");
    assert_eq!(dev.touch_mode(), TouchMode::Point);
    assert_eq!(dev.capabilities().map(|caps| caps.firmware_version), Some(0x21));
  }

  #[test]
  fn probe_powers_up_and_resets_state() {
    let mut dev = sim::device();
    let caps = block_on(dev.probe()).expect("probe");
    assert_eq!(dev.board.power, vec![true]);
    assert_eq!(caps.chip, Chip::Zt7554);
    assert_eq!(dev.touch_mode(), TouchMode::Point);
  }

  #[test]
  fn failed_probe_powers_off() {
    let mut dev = sim::device();
    dev.i2c.set(0x012C, 0x1234);
    assert_eq!(block_on(dev.probe()), Err(Error::ChecksumInvalid(0x1234)));
    assert_eq!(dev.board.power, vec![true, false]);
  }
}
