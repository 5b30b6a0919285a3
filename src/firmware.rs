use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};

use crate::defs::*;
use crate::{Board, Bt532, Capabilities, Error, InputSink, PowerControl};

/// Firmware blob as shipped by the vendor, with its embedded version block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareImage<'a> {
  data: &'a [u8],
}

impl<'a> FirmwareImage<'a> {
  pub const fn new(data: &'a [u8]) -> Self {
    Self { data }
  }

  pub const fn as_bytes(&self) -> &'a [u8] {
    self.data
  }

  pub fn version(&self) -> Option<u16> {
    self.header_u16(IMAGE_VERSION_OFFSET)
  }

  pub fn minor_version(&self) -> Option<u16> {
    self.header_u16(IMAGE_MINOR_OFFSET)
  }

  pub fn data_version(&self) -> Option<u16> {
    self.header_u16(IMAGE_DATA_VERSION_OFFSET)
  }

  /// Whether the device should be reflashed with this image.
  ///
  /// A device version above `0xFF` is the controller's request for a forced
  /// upgrade. Otherwise versions compare major first, then minor, then the
  /// register data version.
  pub fn needs_upgrade(&self, caps: &Capabilities) -> bool {
    let (Some(version), Some(minor), Some(data)) = (self.version(), self.minor_version(), self.data_version()) else {
      return false;
    };
    if caps.firmware_version > FORCED_UPGRADE_VERSION {
      return true;
    }
    let device = (caps.firmware_version, caps.minor_version, caps.data_version);
    device < (version, minor, data)
  }

  fn header_u16(&self, offset: usize) -> Option<u16> {
    let bytes = self.data.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
  }
}

impl<I, E, B, S, D> Bt532<I, B, S, D>
where
  I: I2c<SevenBitAddress, Error = E>,
  B: Board,
  S: InputSink,
  D: DelayNs,
{
  /// Program `image` into flash and verify it by reading every sector back.
  ///
  /// The whole procedure is attempted twice. On success the controller is
  /// restarted with the new firmware; on failure it is left powered off.
  pub(crate) async fn upgrade(&mut self, image: &[u8]) -> Result<(), Error<E>> {
    if image.is_empty() || image.len() % SECTOR_SIZE != 0 {
      return Err(Error::InvalidImage);
    }

    info!("firmware upgrade, {} bytes", image.len());
    for attempt in 1..=UPGRADE_ATTEMPTS {
      match self.flash_once(image).await {
        Ok(true) => {
          info!("firmware verified");
          self.settle_power(PowerControl::Off).await;
          self.settle_power(PowerControl::OnWithBringup).await;
          return Ok(());
        }
        Ok(false) => warn!("firmware verify mismatch, attempt {}", attempt),
        Err(Error::InvalidImage) => {
          self.settle_power(PowerControl::Off).await;
          return Err(Error::InvalidImage);
        }
        Err(_) => warn!("firmware upgrade bus failure, attempt {}", attempt),
      }
      self.settle_power(PowerControl::Off).await;
    }

    error!("firmware upgrade failed");
    Err(Error::UpgradeFailed)
  }

  async fn flash_once(&mut self, image: &[u8]) -> Result<bool, Error<E>> {
    self.power(PowerControl::Off).await?;
    self.power(PowerControl::On).await?;
    self.delay.delay_ms(UPGRADE_POWER_SETTLE_MS).await;

    let chip = self.enter_vendor_mode().await?;
    self.chip = chip;
    if image.len() > chip.flash_size() {
      warn!("image larger than {} flash", chip);
      return Err(Error::InvalidImage);
    }
    self.write_u16(Reg::NvmInit, 1).await?;
    self.delay.delay_ms(UPGRADE_NVM_SETTLE_MS).await;

    self.nvm_write_window(true).await?;
    self.write_u16(Reg::EraseSetup, 7).await?;
    self.write_u16(Reg::EraseAddr0, 0).await?;
    self.write_u16(Reg::EraseAddr1, 0).await?;
    self.command(Cmd::MassErase).await?;
    self.delay.delay_ms(ERASE_SETTLE_MS).await;
    self.write_u16(Reg::EraseSetup, 8).await?;

    self.command(Cmd::InitFlash).await?;
    let sectors_per_page = chip.page_size() / SECTOR_SIZE;
    let sectors = image.len() / SECTOR_SIZE;
    for (index, sector) in image.chunks(SECTOR_SIZE).enumerate() {
      self.write_bytes(Reg::WriteFlash, sector).await?;
      self.delay.delay_us(SECTOR_DELAY_US).await;
      if (index + 1) % sectors_per_page == 0 || index + 1 == sectors {
        self.delay.delay_ms(PAGE_FUSE_DELAY_MS).await;
      }
    }

    self.nvm_write_window(false).await?;
    self.command(Cmd::InitFlash).await?;

    // Read everything back even after a mismatch so a retry starts clean.
    let mut verified = true;
    let mut buf = [0u8; SECTOR_SIZE];
    for sector in image.chunks(SECTOR_SIZE) {
      self.read_flash_bytes(&mut buf).await?;
      verified &= buf[..] == sector[..];
    }
    Ok(verified)
  }

  /// Open or close the non-volatile memory programming window.
  pub(crate) async fn nvm_write_window(&mut self, open: bool) -> Result<(), Error<E>> {
    let value = u16::from(open);
    self.write_u16(Reg::NvmVpp, value).await?;
    self.write_u16(Reg::WriteProtect, value).await
  }

  async fn settle_power(&mut self, ctl: PowerControl) {
    if self.power(ctl).await.is_err() {
      warn!("power {} failed after upgrade", ctl);
    }
  }
}
