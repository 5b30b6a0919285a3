use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};

use crate::defs::*;
use crate::{Board, Bt532, Calibration, Error, InputSink, TouchMode};

/// Buffer for raw sensor frames, one little-endian u16 per node.
#[derive(Debug, Clone)]
pub struct RawCapture {
  buf: [u8; RAW_CAPTURE_CAPACITY],
  len: usize,
}

impl RawCapture {
  pub const fn new() -> Self {
    Self { buf: [0; RAW_CAPTURE_CAPACITY], len: 0 }
  }

  pub fn as_slice(&self) -> &[u8] {
    &self.buf[..self.len]
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// Node `index` of the captured frame.
  pub fn node(&self, index: usize) -> Option<u16> {
    let bytes = self.as_slice().get(index * 2..index * 2 + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
  }

  pub(crate) fn fill(&mut self, len: usize) -> &mut [u8] {
    self.len = len.min(RAW_CAPTURE_CAPACITY);
    &mut self.buf[..self.len]
  }
}

impl Default for RawCapture {
  fn default() -> Self {
    Self::new()
  }
}

impl<I, E, B, S, D> Bt532<I, B, S, D>
where
  I: I2c<SevenBitAddress, Error = E>,
  B: Board,
  S: InputSink,
  D: DelayNs,
{
  /// Switch the reporting mode, restoring analog settings when leaving DND.
  pub(crate) async fn set_touch_mode(&mut self, mode: TouchMode) -> Result<(), Error<E>> {
    let mode = mode.canonical();
    if mode == TouchMode::Dnd {
      self.write_u16(Reg::NCount, DND_N_COUNT).await?;
      self.write_u16(Reg::UCount, DND_U_COUNT).await?;
      self.write_u16(Reg::AfeFrequency, DND_FREQUENCY).await?;
    } else if self.touch_mode.is_dnd() {
      let caps = self.caps.ok_or(Error::NotReady)?;
      self.sync_optional_mode(true).await?;
      self.write_u16(Reg::Shift, caps.shift).await?;
      self.write_u16(Reg::NCount, caps.n_count).await?;
      self.write_u16(Reg::UCount, caps.u_count).await?;
      self.write_u16(Reg::AfeFrequency, caps.afe_frequency).await?;
    }

    info!("touch mode {}", mode);
    self.touch_mode = mode;
    if !mode.is_point() {
      self.write_u16(Reg::DelayRawForHost, RAW_HOST_DELAY).await?;
    }
    self.write_u16(Reg::TouchMode, mode.register_value(&self.config)).await?;

    // Flush frames produced in the old mode.
    for _ in 0..INT_DRAIN_COUNT {
      self.delay.delay_ms(MODE_SETTLE_MS).await;
      self.clear_interrupt().await?;
    }
    Ok(())
  }

  /// Capture one raw frame into [`Bt532::raw`] after dropping `skip` frames.
  ///
  /// Interrupt delivery is masked for the duration; frames are paced by
  /// polling the interrupt line instead.
  pub(crate) async fn capture_raw(&mut self, skip: usize) -> Result<usize, Error<E>> {
    let nodes = self.caps.ok_or(Error::NotReady)?.nodes();
    if nodes > MAX_RAW_NODES {
      return Err(Error::BufferOverflow);
    }
    self.board.disable_irq();
    let result = self.capture_frame(nodes * 2, skip).await;
    self.board.enable_irq();
    result
  }

  async fn capture_frame(&mut self, len: usize, skip: usize) -> Result<usize, Error<E>> {
    for _ in 0..skip {
      self.wait_for_irq().await?;
      self.clear_interrupt().await?;
      self.delay.delay_ms(IRQ_POLL_MS).await;
    }

    self.wait_for_irq().await?;
    let mut raw = core::mem::take(&mut self.raw);
    let result = self.read_raw_bytes(Reg::RawData, raw.fill(len)).await;
    self.raw = raw;
    result?;
    self.clear_interrupt().await?;
    Ok(len)
  }

  async fn wait_for_irq(&mut self) -> Result<(), Error<E>> {
    for _ in 0..IRQ_POLL_LIMIT {
      if self.board.irq_asserted() {
        return Ok(());
      }
      self.delay.delay_ms(IRQ_POLL_MS).await;
    }
    warn!("interrupt line stuck");
    Err(Error::Timeout)
  }

  pub(crate) async fn read_register(&mut self, addr: u16) -> Result<u16, Error<E>> {
    self.read_u16(addr).await
  }

  pub(crate) async fn write_register(&mut self, addr: u16, value: u16) -> Result<(), Error<E>> {
    self.write_u16(addr, value).await
  }

  /// Calibrate on request and put the controller back into its reporting mode.
  pub(crate) async fn calibrate(&mut self) -> Result<Calibration, Error<E>> {
    let outcome = self.calibrate_hardware().await?;
    self.write_u16(Reg::TouchMode, self.touch_mode.register_value(&self.config)).await?;
    self.command(Cmd::SoftwareReset).await?;
    Ok(outcome)
  }
}
