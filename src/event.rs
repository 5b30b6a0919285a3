use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};

use crate::defs::*;
use crate::{Board, Bt532, Error, InputSink};

/// One coordinate record of a point-status snapshot.
///
/// Coordinates are in sensor space until the tracker transforms them; the
/// copies it keeps as last-reported hold screen coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TouchSlot {
  pub x: u16,
  pub y: u16,
  pub width: u8,
  pub sub_status: SubStatus,
  /// Only present in palm-reporting records.
  pub minor_width: u8,
  pub angle: u8,
}

impl TouchSlot {
  pub fn is_present(&self) -> bool {
    self.sub_status.exist()
  }

  fn parse(bytes: &[u8]) -> Self {
    let byte = |i: usize| bytes.get(i).copied().unwrap_or_default();
    Self {
      x: u16::from_le_bytes([byte(0), byte(1)]),
      y: u16::from_le_bytes([byte(2), byte(3)]),
      width: byte(4),
      sub_status: SubStatus::from_bits(byte(5)),
      minor_width: byte(6),
      angle: byte(7),
    }
  }
}

/// Snapshot read from the point-status register block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PointRecord {
  pub status: PointStatus,
  pub finger_count: u8,
  pub time_stamp: u8,
  pub slots: [TouchSlot; MAX_FINGERS],
}

impl PointRecord {
  /// Decode a record laid out with `coord_size` bytes per slot. Slots missing
  /// from a short buffer read as absent.
  pub fn parse(bytes: &[u8], coord_size: usize) -> Self {
    let byte = |i: usize| bytes.get(i).copied().unwrap_or_default();
    let mut record = Self {
      status: PointStatus::from_bits(u16::from_le_bytes([byte(0), byte(1)])),
      finger_count: byte(2),
      time_stamp: byte(3),
      slots: [TouchSlot::default(); MAX_FINGERS],
    };
    let coords = bytes.get(POINT_HEADER_SIZE..).unwrap_or_default();
    for (slot, chunk) in record.slots.iter_mut().zip(coords.chunks(coord_size)) {
      let mut raw = [0u8; COORD_SIZE_PALM];
      raw[..chunk.len()].copy_from_slice(chunk);
      *slot = TouchSlot::parse(&raw[..coord_size]);
    }
    record
  }

  /// Reject snapshots the controller produces when it lost its state.
  pub fn validate<E>(self) -> Result<Self, Error<E>> {
    if self.status.must_zero() || self.status.is_reset_marker() {
      return Err(Error::ProtocolViolation(self.status.into_bits()));
    }
    Ok(self)
  }

  /// A zero status word comes from periodic interrupts with nothing to say.
  pub fn is_spurious(&self) -> bool {
    self.status.into_bits() == 0
  }
}

impl<I, E, B, S, D> Bt532<I, B, S, D>
where
  I: I2c<SevenBitAddress, Error = E>,
  B: Board,
  S: InputSink,
  D: DelayNs,
{
  /// Read and validate the point record for the current touch mode.
  ///
  /// Raw modes prepend one u16 per sensor node; the frame is kept in the raw
  /// capture buffer and the record is taken from behind it.
  pub(crate) async fn read_point_record(&mut self) -> Result<PointRecord, Error<E>> {
    let record_len = self.config.point_record_size();
    let coord_size = self.config.coord_size();

    if self.touch_mode.is_point() {
      let mut buf = [0u8; POINT_RECORD_MAX];
      self.read_bytes(Reg::PointStatus, &mut buf[..record_len]).await?;
      return PointRecord::parse(&buf[..record_len], coord_size).validate();
    }

    let nodes = self.caps.ok_or(Error::NotReady)?.nodes();
    if nodes > MAX_RAW_NODES {
      return Err(Error::BufferOverflow);
    }
    let offset = nodes * 2;
    let mut raw = core::mem::take(&mut self.raw);
    let result = self.read_raw_bytes(Reg::RawData, raw.fill(offset + record_len)).await;
    let record = PointRecord::parse(&raw.as_slice()[offset..], coord_size);
    self.raw = raw;
    result?;
    record.validate()
  }
}

#[cfg(test)]
mod tests {
  use embassy_futures::block_on;

  use super::*;
  use crate::sim::{self, Op};
  use crate::{Capabilities, TouchMode};

  #[test]
  fn parses_palm_layout() {
    let bytes = sim::record(0x0802).slot(1, 100, 200, 7, 0x03).minor(1, 5).build();
    let record = PointRecord::parse(&bytes, COORD_SIZE_PALM);
    assert!(record.status.exist());
    assert!(!record.slots[0].is_present());
    let slot = record.slots[1];
    assert_eq!((slot.x, slot.y, slot.width, slot.minor_width), (100, 200, 7, 5));
    assert!(slot.sub_status.down());
  }

  #[test]
  fn parses_compact_layout() {
    let bytes = sim::record(0x0802).coord_size(COORD_SIZE).slot(9, 1, 2, 3, 0x01).build();
    assert_eq!(bytes.len(), 64);
    let record = PointRecord::parse(&bytes, COORD_SIZE);
    assert_eq!(record.slots[9].x, 1);
    assert!(record.slots[9].is_present());
  }

  #[test]
  fn short_buffer_reads_as_absent() {
    let record = PointRecord::parse(&[0x02, 0x08], COORD_SIZE_PALM);
    assert!(record.status.exist());
    assert!(record.slots.iter().all(|slot| !slot.is_present()));
  }

  #[test]
  fn reset_markers_are_violations() {
    for status in [0xFFFFu16, 0x0001, 0x2802] {
      let record = PointRecord::parse(&status.to_le_bytes(), COORD_SIZE_PALM);
      assert_eq!(record.validate::<()>(), Err(Error::ProtocolViolation(status)));
    }
    let record = PointRecord::parse(&[0, 0], COORD_SIZE_PALM);
    assert!(record.validate::<()>().expect("valid").is_spurious());
  }

  #[test]
  fn point_mode_reads_status_block() {
    let mut dev = sim::device();
    dev.i2c.push_record(sim::record(0x0802).slot(0, 10, 20, 4, 0x03).build());
    let record = block_on(dev.read_point_record()).expect("record");
    assert_eq!(record.slots[0].y, 20);
    assert_eq!(dev.i2c.ops(), vec![Op::Read(0x0080)]);
  }

  #[test]
  fn raw_mode_takes_record_behind_frame() {
    let mut dev = sim::device();
    dev.touch_mode = TouchMode::Delta;
    dev.caps = Some(Capabilities { x_nodes: 3, y_nodes: 2, ..Capabilities::default() });
    let mut frame = vec![0xAB; 12];
    frame.extend(sim::record(0x0802).slot(2, 30, 40, 1, 0x01).build());
    dev.i2c.set_raw_frame(frame);

    let record = block_on(dev.read_point_record()).expect("record");
    assert_eq!((record.slots[2].x, record.slots[2].y), (30, 40));
    assert_eq!(dev.raw().len(), 12 + 84);
    assert_eq!(dev.raw().as_slice()[..12], [0xAB; 12]);
    assert_eq!(dev.i2c.ops(), vec![Op::Read(0x0200)]);
  }

  #[test]
  fn raw_mode_needs_capabilities() {
    let mut dev = sim::device();
    dev.touch_mode = TouchMode::Reference;
    assert_eq!(block_on(dev.read_point_record()), Err(Error::NotReady));
  }
}
