use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};

use crate::defs::*;
use crate::{Board, Bt532, Error, InputSink};

/// Supply transitions understood by the power sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerControl {
  Off,
  /// Raw power only, the controller stays in its boot loader.
  On,
  /// Power plus the vendor bring-up sequence that starts the firmware.
  OnWithBringup,
}

impl<I, E, B, S, D> Bt532<I, B, S, D>
where
  I: I2c<SevenBitAddress, Error = E>,
  B: Board,
  S: InputSink,
  D: DelayNs,
{
  pub(crate) async fn power(&mut self, ctl: PowerControl) -> Result<(), Error<E>> {
    debug!("power {}", ctl);
    let on = !matches!(ctl, PowerControl::Off);
    self.board.set_power(on).map_err(|_| Error::PowerSequence)?;
    self.board.configure_pins(on);
    self.powered = on;

    match ctl {
      PowerControl::Off => self.delay.delay_ms(CHIP_OFF_DELAY_MS).await,
      PowerControl::On => self.delay.delay_ms(CHIP_ON_DELAY_MS).await,
      PowerControl::OnWithBringup => {
        self.delay.delay_ms(CHIP_ON_DELAY_MS).await;
        self.bring_up().await?;
      }
    }
    Ok(())
  }

  /// Restart the controller from scratch after a fault.
  pub(crate) async fn power_cycle(&mut self) -> Result<(), Error<E>> {
    self.power(PowerControl::Off).await?;
    self.power(PowerControl::OnWithBringup).await
  }

  async fn bring_up(&mut self) -> Result<(), Error<E>> {
    let mut retry = 0;
    loop {
      match self.bring_up_once().await {
        Ok(chip) => {
          info!("chip {} ({} KiB flash)", chip, chip.flash_size() / 1024);
          self.chip = chip;
          return Ok(());
        }
        Err(_) if retry < BRINGUP_RETRIES => {
          retry += 1;
          warn!("bring-up failed, retry {}", retry);
          self.delay.delay_ms(CHIP_ON_DELAY_MS).await;
        }
        Err(_) => {
          error!("bring-up failed");
          return Err(Error::PowerSequence);
        }
      }
    }
  }

  async fn bring_up_once(&mut self) -> Result<Chip, Error<E>> {
    let chip = self.enter_vendor_mode().await?;
    self.write_u16(Reg::NvmInit, 1).await?;
    self.delay.delay_ms(NVM_INIT_DELAY_MS).await;
    self.write_u16(Reg::ProgramStart, 1).await?;
    self.delay.delay_ms(FIRMWARE_ON_DELAY_MS).await;
    Ok(chip)
  }

  /// Quiesce and power down ahead of a display blank.
  pub(crate) async fn early_suspend(&mut self) -> Result<(), Error<E>> {
    self.board.disable_irq();
    self.clear_reports();
    if self.config.watchdog.is_some() && self.write_u16(Reg::PeriodicInterval, 0).await.is_err() {
      warn!("periodic interrupt not stopped");
    }
    self.power(PowerControl::Off).await
  }

  /// Put the controller to sleep and cut its supply.
  pub(crate) async fn suspend(&mut self) -> Result<(), Error<E>> {
    self.board.disable_irq();
    self.clear_reports();
    if self.powered && self.command(Cmd::Sleep).await.is_err() {
      warn!("sleep command failed");
    }
    self.power(PowerControl::Off).await
  }

  /// Bring a suspended controller back. Interrupts are re-enabled even when
  /// reprogramming fails so the watchdog path can take over.
  pub(crate) async fn wake(&mut self) -> Result<(), Error<E>> {
    let result = match self.power(PowerControl::OnWithBringup).await {
      Ok(()) => self.mini_init().await,
      Err(e) => Err(e),
    };
    self.board.enable_irq();
    result
  }

  pub(crate) async fn shutdown(&mut self) -> Result<(), Error<E>> {
    self.board.disable_irq();
    self.clear_reports();
    self.power(PowerControl::Off).await
  }

  /// Unlock the vendor page, identify the silicon and clear the latch.
  pub(crate) async fn enter_vendor_mode(&mut self) -> Result<Chip, Error<E>> {
    self.write_u16(Reg::VendorEnable, 1).await?;
    self.delay.delay_us(BRINGUP_STEP_US).await;
    let chip = Chip::from_code(self.read_u16(Reg::ChipCode).await?);
    self.delay.delay_us(BRINGUP_STEP_US).await;
    self.command(Cmd::VendorClearInt).await?;
    self.delay.delay_us(BRINGUP_STEP_US).await;
    Ok(chip)
  }
}
