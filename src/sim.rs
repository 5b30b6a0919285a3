//! Simulated controller, board and sinks for unit tests.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use embedded_hal::i2c::ErrorKind;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{ErrorType, I2c, Operation, SevenBitAddress};

use crate::{Board, Bt532, Config, InputEvent, InputSink};

const FLASH_SIZE: usize = 64 * 1024;
const COMMANDS: [u16; 3] = [0x01D0, 0xC004, 0xC10B];

const EEPROM: u16 = 0x0018;
const FIRMWARE_VERSION: u16 = 0x0012;
const CHECKSUM: u16 = 0x012C;
const POINT_STATUS: u16 = 0x0080;
const RAW_DATA: u16 = 0x0200;
const WRITE_FLASH: u16 = 0x01D1;
const READ_FLASH: u16 = 0x01D2;
const VENDOR_ENABLE: u16 = 0xC000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusFault;

impl embedded_hal::i2c::Error for BusFault {
  fn kind(&self) -> ErrorKind {
    ErrorKind::Other
  }
}

/// Bus traffic as the controller saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
  Read(u16),
  Write(u16, u16),
  Cmd(u16),
  Bytes(u16, Vec<u8>),
}

pub struct SimBus {
  regs: HashMap<u16, u16>,
  selected: u16,
  ops: Vec<Op>,
  frames: Vec<Vec<u8>>,
  fail_writes: usize,
  fail_reads: HashMap<u16, usize>,
  corrupt_reads: usize,
  flash: Vec<u8>,
  flash_ptr: usize,
  records: VecDeque<Vec<u8>>,
  raw_frame: Vec<u8>,
  calibration_latency: usize,
  calibrating: usize,
  heal_on_upgrade: bool,
  heal_on_bringup: bool,
  version_after_upgrade: Option<u16>,
}

impl Default for SimBus {
  fn default() -> Self {
    let regs = HashMap::from([
      (CHECKSUM, 0x55AA),
      (0xCC00, 0xE700),
      (FIRMWARE_VERSION, 0x0010),
      (0x0060, 2),
      (0x0061, 5),
    ]);
    Self {
      regs,
      selected: 0,
      ops: Vec::new(),
      frames: Vec::new(),
      fail_writes: 0,
      fail_reads: HashMap::new(),
      corrupt_reads: 0,
      flash: vec![0xFF; FLASH_SIZE],
      flash_ptr: 0,
      records: VecDeque::new(),
      raw_frame: Vec::new(),
      calibration_latency: 0,
      calibrating: 0,
      heal_on_upgrade: false,
      heal_on_bringup: false,
      version_after_upgrade: None,
    }
  }
}

impl SimBus {
  pub fn set(&mut self, addr: u16, value: u16) {
    self.regs.insert(addr, value);
  }

  pub fn ops(&self) -> Vec<Op> {
    self.ops.clone()
  }

  /// Raw bytes of every write that reached the bus.
  pub fn frames(&self) -> Vec<Vec<u8>> {
    self.frames.clone()
  }

  pub fn clear_ops(&mut self) {
    self.ops.clear();
    self.frames.clear();
  }

  /// Fail the next `count` writes of any kind.
  pub fn fail_writes(&mut self, count: usize) {
    self.fail_writes = count;
  }

  /// Fail the data phase of the next `count` reads of `addr`.
  pub fn fail_reads_of(&mut self, addr: u16, count: usize) {
    self.fail_reads.insert(addr, count);
  }

  /// Flip bytes in the next `count` flash read-backs.
  pub fn corrupt_readback(&mut self, count: usize) {
    self.corrupt_reads = count;
  }

  pub fn flash(&self) -> &[u8] {
    &self.flash
  }

  pub fn push_record(&mut self, record: Vec<u8>) {
    self.records.push_back(record);
  }

  pub fn set_raw_frame(&mut self, frame: Vec<u8>) {
    self.raw_frame = frame;
  }

  /// Keep the calibration flag raised for `polls` EEPROM reads after each
  /// calibrate command.
  pub fn set_calibration_latency(&mut self, polls: usize) {
    self.calibration_latency = polls;
  }

  pub fn heal_checksum_on_upgrade(&mut self) {
    self.heal_on_upgrade = true;
  }

  pub fn heal_checksum_on_bringup(&mut self) {
    self.heal_on_bringup = true;
  }

  pub fn set_version_after_upgrade(&mut self, version: u16) {
    self.version_after_upgrade = Some(version);
  }

  fn write(&mut self, bytes: &[u8]) -> Result<(), BusFault> {
    if self.fail_writes > 0 {
      self.fail_writes -= 1;
      return Err(BusFault);
    }
    self.frames.push(bytes.to_vec());

    let addr = u16::from_le_bytes([bytes[0], bytes[1]]);
    let payload = &bytes[2..];
    if payload.is_empty() {
      if addr <= 0x000F || COMMANDS.contains(&addr) {
        self.ops.push(Op::Cmd(addr));
        self.command(addr);
      } else {
        self.selected = addr;
      }
      return Ok(());
    }

    if addr == WRITE_FLASH {
      let end = (self.flash_ptr + payload.len()).min(FLASH_SIZE);
      self.flash[self.flash_ptr..end].copy_from_slice(&payload[..end - self.flash_ptr]);
      self.flash_ptr = end;
      self.ops.push(Op::Bytes(addr, payload.to_vec()));
      return Ok(());
    }

    let value = u16::from_le_bytes([payload[0], payload.get(1).copied().unwrap_or_default()]);
    self.regs.insert(addr, value);
    self.ops.push(Op::Write(addr, value));
    if addr == VENDOR_ENABLE && self.heal_on_bringup {
      self.regs.insert(CHECKSUM, 0x55AA);
    }
    Ok(())
  }

  fn command(&mut self, addr: u16) {
    match addr {
      0x0006 => {
        let eeprom = self.regs.entry(EEPROM).or_default();
        *eeprom &= !1;
        self.calibrating = self.calibration_latency;
      }
      0x01D0 => self.flash_ptr = 0,
      0xC10B => {
        self.flash.fill(0xFF);
        if self.heal_on_upgrade {
          self.regs.insert(CHECKSUM, 0x55AA);
        }
        if let Some(version) = self.version_after_upgrade {
          self.regs.insert(FIRMWARE_VERSION, version);
        }
      }
      _ => {}
    }
  }

  fn read(&mut self, buf: &mut [u8]) -> Result<(), BusFault> {
    let addr = self.selected;
    if let Some(count) = self.fail_reads.get_mut(&addr) {
      if *count > 0 {
        if *count != usize::MAX {
          *count -= 1;
        }
        return Err(BusFault);
      }
    }

    buf.fill(0);
    match addr {
      POINT_STATUS => {
        let record = self.records.pop_front().unwrap_or_default();
        copy_prefix(buf, &record);
      }
      RAW_DATA => copy_prefix(buf, &self.raw_frame),
      READ_FLASH => {
        let start = self.flash_ptr.min(FLASH_SIZE);
        let end = (start + buf.len()).min(FLASH_SIZE);
        buf.fill(0xFF);
        buf[..end - start].copy_from_slice(&self.flash[start..end]);
        self.flash_ptr = end;
        if self.corrupt_reads > 0 {
          self.corrupt_reads -= 1;
          buf[0] ^= 0xFF;
        }
      }
      _ => {
        let mut value = self.regs.get(&addr).copied().unwrap_or_default();
        if addr == EEPROM && self.calibrating > 0 {
          if self.calibrating != usize::MAX {
            self.calibrating -= 1;
          }
          value |= 1;
        }
        copy_prefix(buf, &value.to_le_bytes());
      }
    }
    self.ops.push(Op::Read(addr));
    Ok(())
  }
}

fn copy_prefix(buf: &mut [u8], data: &[u8]) {
  let len = buf.len().min(data.len());
  buf[..len].copy_from_slice(&data[..len]);
}

impl ErrorType for SimBus {
  type Error = BusFault;
}

impl I2c<SevenBitAddress> for SimBus {
  async fn transaction(&mut self, address: u8, operations: &mut [Operation<'_>]) -> Result<(), Self::Error> {
    assert_eq!(address, 0x20);
    for operation in operations {
      match operation {
        Operation::Write(bytes) => self.write(bytes)?,
        Operation::Read(buf) => self.read(buf)?,
      }
    }
    Ok(())
  }
}

#[derive(Debug)]
pub struct SimBoard {
  pub power: Vec<bool>,
  pub pins: Vec<bool>,
  pub fail_power: bool,
  /// `true` for every enable, `false` for every disable.
  pub irq_calls: Vec<bool>,
  /// Line level once the script ran out.
  pub irq_idle: bool,
  script: VecDeque<bool>,
}

impl Default for SimBoard {
  fn default() -> Self {
    Self {
      power: Vec::new(),
      pins: Vec::new(),
      fail_power: false,
      irq_calls: Vec::new(),
      irq_idle: true,
      script: VecDeque::new(),
    }
  }
}

impl SimBoard {
  /// Levels returned by the next interrupt line samples.
  pub fn irq_script(&mut self, levels: impl IntoIterator<Item = bool>) {
    self.script.extend(levels);
  }
}

impl Board for SimBoard {
  type Error = BusFault;

  fn set_power(&mut self, on: bool) -> Result<(), Self::Error> {
    if self.fail_power {
      return Err(BusFault);
    }
    self.power.push(on);
    Ok(())
  }

  fn configure_pins(&mut self, active: bool) {
    self.pins.push(active);
  }

  fn enable_irq(&mut self) {
    self.irq_calls.push(true);
  }

  fn disable_irq(&mut self) {
    self.irq_calls.push(false);
  }

  fn irq_asserted(&mut self) -> bool {
    self.script.pop_front().unwrap_or(self.irq_idle)
  }
}

#[derive(Debug, Default)]
pub struct Recorder {
  events: Vec<InputEvent>,
}

impl Recorder {
  pub fn take(&mut self) -> Vec<InputEvent> {
    core::mem::take(&mut self.events)
  }
}

impl InputSink for Recorder {
  fn report(&mut self, event: InputEvent) {
    self.events.push(event);
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
  Ns(u32),
  Us(u32),
  Ms(u32),
}

/// Delay that returns at once and remembers what it was asked for.
#[derive(Debug, Clone, Default)]
pub struct NoDelay {
  waits: Vec<Wait>,
}

impl NoDelay {
  /// Sum of all millisecond delays.
  pub fn ms_waited(&self) -> u32 {
    self.waits.iter().map(|wait| if let Wait::Ms(ms) = wait { *ms } else { 0 }).sum()
  }

  pub fn count_ms(&self, ms: u32) -> usize {
    self.waits.iter().filter(|wait| **wait == Wait::Ms(ms)).count()
  }

  pub fn count_us(&self, us: u32) -> usize {
    self.waits.iter().filter(|wait| **wait == Wait::Us(us)).count()
  }
}

impl DelayNs for NoDelay {
  async fn delay_ns(&mut self, ns: u32) {
    self.waits.push(Wait::Ns(ns));
  }

  async fn delay_us(&mut self, us: u32) {
    self.waits.push(Wait::Us(us));
  }

  async fn delay_ms(&mut self, ms: u32) {
    self.waits.push(Wait::Ms(ms));
  }
}

/// Timer that never fires and counts how often it was started.
#[derive(Debug, Clone, Default)]
pub struct StalledTimer {
  started: Rc<Cell<usize>>,
}

impl StalledTimer {
  pub fn started(&self) -> usize {
    self.started.get()
  }
}

impl DelayNs for StalledTimer {
  async fn delay_ns(&mut self, _ns: u32) {
    self.started.set(self.started.get() + 1);
    core::future::pending::<()>().await
  }

  async fn delay_ms(&mut self, _ms: u32) {
    self.started.set(self.started.get() + 1);
    core::future::pending::<()>().await
  }
}

pub type SimDevice = Bt532<SimBus, SimBoard, Recorder, NoDelay>;

/// 480x800 panel, palm reporting on, three second watchdog.
pub fn config() -> Config {
  Config::new(480, 800)
}

pub fn device() -> SimDevice {
  device_with(config())
}

pub fn device_with(config: Config) -> SimDevice {
  Bt532::new(SimBus::default(), SimBoard::default(), Recorder::default(), NoDelay::default(), config)
}

/// Firmware image of `len` bytes carrying the given version block.
pub fn image(len: usize, version: u16, minor: u16, data: u16) -> &'static [u8] {
  let mut bytes: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
  for (offset, value) in [(52, version), (56, minor), (60, data)] {
    if offset + 2 <= len {
      bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }
  }
  Vec::leak(bytes)
}

pub fn record(status: u16) -> RecordBuilder {
  RecordBuilder { status, coord_size: 8, slots: [[0; 8]; 10] }
}

/// Point-status record in wire layout.
pub struct RecordBuilder {
  status: u16,
  coord_size: usize,
  slots: [[u8; 8]; 10],
}

impl RecordBuilder {
  pub fn coord_size(mut self, size: usize) -> Self {
    self.coord_size = size;
    self
  }

  pub fn slot(mut self, index: usize, x: u16, y: u16, width: u8, sub_status: u8) -> Self {
    let slot = &mut self.slots[index];
    slot[..2].copy_from_slice(&x.to_le_bytes());
    slot[2..4].copy_from_slice(&y.to_le_bytes());
    slot[4] = width;
    slot[5] = sub_status;
    self
  }

  pub fn minor(mut self, index: usize, width: u8) -> Self {
    self.slots[index][6] = width;
    self
  }

  pub fn build(self) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + 10 * self.coord_size);
    bytes.extend_from_slice(&self.status.to_le_bytes());
    bytes.extend_from_slice(&[0, 0]);
    for slot in &self.slots {
      bytes.extend_from_slice(&slot[..self.coord_size]);
    }
    bytes
  }
}
