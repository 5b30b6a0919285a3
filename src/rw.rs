use embedded_hal::i2c::{Error as _, ErrorKind, ErrorType};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};

use crate::defs::*;
use crate::{Board, Bt532, Error, InputSink};

impl<I, E, B, S, D> Bt532<I, B, S, D>
where
  I: I2c<SevenBitAddress, Error = E>,
  B: Board,
  S: InputSink,
  D: DelayNs,
{
  // Typed helpers
  pub(crate) async fn read_as<T: From<u16>>(&mut self, reg: impl Into<u16>) -> Result<T, Error<E>> {
    Ok(T::from(self.read_u16(reg).await?))
  }

  pub(crate) async fn read_u16(&mut self, reg: impl Into<u16>) -> Result<u16, Error<E>> {
    let mut buf = [0u8; 2];
    self.read_bytes(reg, &mut buf).await?;
    Ok(u16::from_le_bytes(buf))
  }

  pub(crate) async fn write_u16(&mut self, reg: impl Into<u16>, value: u16) -> Result<(), Error<E>> {
    self.write_bytes(reg, &value.to_le_bytes()).await
  }

  pub(crate) async fn read_bytes(&mut self, reg: impl Into<u16>, buf: &mut [u8]) -> Result<(), Error<E>> {
    self.read_with_setup(reg.into(), buf, TRANSACTION_SETUP_US).await
  }

  /// Bulk sensor data needs a longer settle before the data phase.
  pub(crate) async fn read_raw_bytes(&mut self, reg: impl Into<u16>, buf: &mut [u8]) -> Result<(), Error<E>> {
    self.read_with_setup(reg.into(), buf, RAW_SETUP_US).await
  }

  pub(crate) async fn read_flash_bytes(&mut self, buf: &mut [u8]) -> Result<(), Error<E>> {
    self.read_with_setup(Reg::ReadFlash.into(), buf, FLASH_SETUP_US).await
  }

  pub(crate) async fn write_bytes(&mut self, reg: impl Into<u16>, data: &[u8]) -> Result<(), Error<E>> {
    let len = data.len();
    if len > MAX_WRITE_PAYLOAD {
      return Err(Error::BufferOverflow);
    }
    let mut buf = [0u8; MAX_WRITE_PAYLOAD + 2];
    buf[..2].copy_from_slice(&reg.into().to_le_bytes());
    buf[2..2 + len].copy_from_slice(data);
    self.write_retrying(&buf[..2 + len]).await?;
    self.delay.delay_us(POST_TRANSACTION_US).await;
    Ok(())
  }

  /// Issue a command register; the address phase alone triggers it.
  pub(crate) async fn command(&mut self, cmd: Cmd) -> Result<(), Error<E>> {
    let addr = u16::from(cmd).to_le_bytes();
    self.write_retrying(&addr).await?;
    self.delay.delay_us(POST_TRANSACTION_US).await;
    Ok(())
  }

  pub(crate) async fn clear_interrupt(&mut self) -> Result<(), Error<E>> {
    self.command(Cmd::ClearInt).await
  }

  async fn read_with_setup(&mut self, addr: u16, buf: &mut [u8], setup_us: u32) -> Result<(), Error<E>> {
    // Only the select phase is retried, a failed data phase leaves the
    // register pointer in an unknown place.
    self.write_retrying(&addr.to_le_bytes()).await?;
    self.delay.delay_us(setup_us).await;
    self.i2c.read(I2C_ADDR, buf).await.map_err(Error::I2c)
  }

  async fn write_retrying(&mut self, bytes: &[u8]) -> Result<(), Error<E>> {
    let mut attempt = 1;
    loop {
      match self.i2c.write(I2C_ADDR, bytes).await {
        Ok(()) => return Ok(()),
        Err(e) if attempt >= BUS_RETRIES => {
          warn!("i2c write failed after {} attempts: {}", attempt, kind::<I>(&e));
          return Err(Error::I2c(e));
        }
        Err(_) => {
          attempt += 1;
          self.delay.delay_ms(BUS_RETRY_BACKOFF_MS).await;
        }
      }
    }
  }
}

fn kind<I: ErrorType>(e: &I::Error) -> ErrorKind {
  e.kind()
}
