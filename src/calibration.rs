use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};

use crate::defs::*;
use crate::{Board, Bt532, Error, InputSink};

/// Outcome of a hardware calibration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Calibration {
  Completed,
  /// The controller never cleared its calibration flag. It keeps running
  /// with whatever reference it has.
  TimedOut,
}

impl<I, E, B, S, D> Bt532<I, B, S, D>
where
  I: I2c<SevenBitAddress, Error = E>,
  B: Board,
  S: InputSink,
  D: DelayNs,
{
  /// Run the on-chip calibration and store the result in flash.
  pub(crate) async fn calibrate_hardware(&mut self) -> Result<Calibration, Error<E>> {
    self.write_u16(Reg::TouchMode, CALIBRATION_MODE).await?;
    self.delay.delay_ms(10).await;
    for settle_ms in [10, 50, 10] {
      self.clear_interrupt().await?;
      self.delay.delay_ms(settle_ms).await;
    }

    self.command(Cmd::Calibrate).await?;
    self.clear_interrupt().await?;
    self.delay.delay_ms(10).await;
    self.clear_interrupt().await?;

    let mut outcome = Calibration::TimedOut;
    for poll in 1..=CALIBRATION_POLLS {
      self.delay.delay_ms(CALIBRATION_POLL_MS).await;
      self.clear_interrupt().await?;
      let info: EepromInfo = self.read_as(Reg::EepromInfo).await?;
      if !info.needs_calibration() {
        outcome = Calibration::Completed;
        break;
      }
      if poll == CALIBRATION_REISSUE_POLL {
        debug!("calibration slow, reissuing");
        self.command(Cmd::Calibrate).await?;
        self.delay.delay_ms(10).await;
        self.clear_interrupt().await?;
      }
    }
    if outcome == Calibration::TimedOut {
      warn!("hardware calibration timed out");
    }

    self.write_u16(Reg::TouchMode, self.config.point_mode()).await?;
    let mask = self.interrupt_mask();
    if mask != 0 {
      self.write_u16(Reg::IntEnable, mask).await?;
    }

    self.nvm_write_window(true).await?;
    self.delay.delay_us(NVM_BRACKET_US).await;
    self.command(Cmd::SaveCalibration).await?;
    self.delay.delay_ms(SAVE_CALIBRATION_MS).await;
    self.nvm_write_window(false).await?;

    Ok(outcome)
  }

  /// Persist the controller's runtime status block.
  pub(crate) async fn save_status(&mut self) -> Result<(), Error<E>> {
    self.save_status_for(SAVE_STATUS_MS).await
  }

  /// Invalidate the stored reference so the next boot recalibrates.
  pub(crate) async fn clear_reference(&mut self) -> Result<(), Error<E>> {
    self.write_u16(Reg::EepromInfo, 0xFFFF).await?;
    self.save_status_for(CLEAR_REFERENCE_MS).await
  }

  async fn save_status_for(&mut self, settle_ms: u32) -> Result<(), Error<E>> {
    self.nvm_write_window(true).await?;
    self.delay.delay_us(NVM_BRACKET_US).await;
    self.command(Cmd::SaveStatus).await?;
    self.delay.delay_ms(settle_ms).await;
    self.nvm_write_window(false).await
  }

  pub(crate) fn interrupt_mask(&self) -> u16 {
    interrupt_mask(self.config.palm_reporting, self.config.has_buttons())
  }
}
