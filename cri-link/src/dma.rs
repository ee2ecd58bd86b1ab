//! DMA channel of a single link
//!
//! The DMA engine of a link writes into two ring buffers in
//! host memory, the event (data) buffer and the report
//! (descriptor) buffer. Both are given as bus address and
//! log2 of their size, the wrap logic of the firmware masks
//! the write pointers, so sizes are always powers of two.
//!
//! The memory belongs to the caller. A channel only ever
//! programs the engine with the addresses, it never reads,
//! clears or frees the buffers.

use std::fmt;
use std::thread;
use std::time::Duration;

use crate::errors::{
    CriError,
    RegisterError,
};
use crate::memory::RegisterFile;
use crate::registers::*;

/// Transfer unit of the DMA engine in bytes, fixed
/// for this hardware generation
pub const DMA_TRANSFER_SIZE     : usize = 128;
/// A ring has to hold at least one transfer
pub const DMA_MIN_LOG_SIZE      : u32   = 7;
/// The size registers of the engine are 48bit wide
pub const DMA_MAX_LOG_SIZE      : u32   = 47;
/// Size of one entry in the descriptor ring in bytes
pub const DMA_DESC_ENTRY_SIZE   : u64   = 32;

/// How often to check for outstanding transfers
/// before the engine is disarmed anyway
pub const DMA_DISABLE_POLL_ATTEMPTS : u32      = 100;
pub const DMA_DISABLE_POLL_INTERVAL : Duration = Duration::from_micros(100);

/// Non-owning handle to a caller allocated ring buffer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DmaBuffer {
  /// Address of the buffer as seen from the device
  pub bus_addr : u64,
  /// log2 of the size in bytes
  pub log_size : u32,
}

impl DmaBuffer {
  pub fn new(bus_addr : u64, log_size : u32) -> Self {
    Self {
      bus_addr,
      log_size,
    }
  }

  pub fn size(&self) -> u64 {
    1u64 << self.log_size
  }

  /// first address past the buffer
  pub fn end(&self) -> u64 {
    self.bus_addr + self.size()
  }

  /// Check the constraints of the DMA engine, without
  /// touching any register
  pub fn validate(&self) -> Result<(), CriError> {
    if self.log_size < DMA_MIN_LOG_SIZE || self.log_size > DMA_MAX_LOG_SIZE {
      return Err(CriError::InvalidBufferLogSize(self.log_size));
    }
    if self.bus_addr % DMA_TRANSFER_SIZE as u64 != 0 {
      return Err(CriError::MisalignedBuffer(self.bus_addr));
    }
    if self.bus_addr.checked_add(self.size()).is_none() {
      return Err(CriError::BufferWrapsAddressSpace(self.bus_addr));
    }
    Ok(())
  }

  pub fn overlaps(&self, other : &DmaBuffer) -> bool {
    self.bus_addr < other.end() && other.bus_addr < self.end()
  }

  /// Check a data/descriptor buffer pair, without
  /// touching any register
  pub fn validate_pair(data : &DmaBuffer, desc : &DmaBuffer) -> Result<(), CriError> {
    data.validate()?;
    desc.validate()?;
    if data.overlaps(desc) {
      return Err(CriError::BufferOverlap);
    }
    Ok(())
  }
}

/// Disarm the DMA engine behind a packetizer bank
///
/// Waits (bounded) for outstanding transfers, then clears
/// the enable bit and flushes the fifo. Works without a
/// `DmaChannel`, e.g. for an engine a crashed process left
/// armed.
pub(crate) fn disarm_engine(rfpkt : &RegisterFile, link_index : usize) -> Result<(), RegisterError> {
  let mut attempts = DMA_DISABLE_POLL_ATTEMPTS;
  loop {
    match rfpkt.get_bit(REG_DMA_CTRL, DMA_CTRL_BUSY_BIT) {
      Err(err)  => {
        warn!("Unable to query DMA busy state of link {}! {}", link_index, err);
        break;
      }
      Ok(false) => break,
      Ok(true)  => ()
    }
    if attempts == 0 {
      error!("DMA engine of link {} still busy, disabling anyway!", link_index);
      break;
    }
    attempts -= 1;
    thread::sleep(DMA_DISABLE_POLL_INTERVAL);
  }
  rfpkt.set_bit(REG_DMA_CTRL, DMA_CTRL_ENABLE_BIT, false)?;
  rfpkt.set_bit(REG_DMA_CTRL, DMA_CTRL_FIFO_RESET_BIT, true)?;
  Ok(())
}

impl fmt::Display for DmaBuffer {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<DmaBuffer: 0x{:x} - 0x{:x} ({} bytes)>", self.bus_addr, self.end(), self.size())
  }
}

/// An armed DMA engine of one link
///
/// Only `CriLink::init_dma` creates channels. Dropping the
/// channel disarms the engine.
pub struct DmaChannel {
  link_index    : usize,
  rfpkt         : RegisterFile,
  data_buffer   : DmaBuffer,
  desc_buffer   : DmaBuffer,
  transfer_size : usize,
}

impl DmaChannel {

  /// Program the engine of a link and arm it
  ///
  /// If any of the register writes fails, the engine
  /// is disarmed again and the error is returned.
  pub(crate) fn new(link_index    : usize,
                    rfpkt         : RegisterFile,
                    data_buffer   : DmaBuffer,
                    desc_buffer   : DmaBuffer,
                    transfer_size : usize) -> Result<Self, CriError> {
    DmaBuffer::validate_pair(&data_buffer, &desc_buffer)?;
    // someone else (another process?) has a session
    // running on this link
    if rfpkt.get_bit(REG_DMA_CTRL, DMA_CTRL_ENABLE_BIT)? {
      error!("DMA engine of link {} is already enabled!", link_index);
      return Err(CriError::DmaEngineBusy);
    }
    let channel = Self {
      link_index,
      rfpkt,
      data_buffer,
      desc_buffer,
      transfer_size,
    };
    match channel.configure() {
      Err(err) => {
        error!("Programming DMA engine of link {} failed! {}", link_index, err);
        // dropping disarms the engine
        drop(channel);
        Err(err.into())
      }
      Ok(_) => {
        info!("DMA engine of link {} armed, data {}, desc {}", link_index, data_buffer, desc_buffer);
        Ok(channel)
      }
    }
  }

  fn configure(&self) -> Result<(), RegisterError> {
    let rf = &self.rfpkt;
    rf.set_reg_u64(REG_EBDM_BUFFER_ADDR_L, REG_EBDM_BUFFER_ADDR_H, self.data_buffer.bus_addr)?;
    rf.set_reg_full(REG_EBDM_BUFFER_LOG_SIZE, self.data_buffer.log_size)?;
    rf.set_reg_u64(REG_RBDM_BUFFER_ADDR_L, REG_RBDM_BUFFER_ADDR_H, self.desc_buffer.bus_addr)?;
    rf.set_reg_full(REG_RBDM_BUFFER_LOG_SIZE, self.desc_buffer.log_size)?;
    rf.set_reg_full(REG_DMA_TRANSFER_SIZE, (self.transfer_size / 4) as u32)?;
    rf.set_reg_u64(REG_EBDM_SW_READ_POINTER_L, REG_EBDM_SW_READ_POINTER_H, 0)?;
    rf.set_reg_u64(REG_RBDM_SW_READ_POINTER_L, REG_RBDM_SW_READ_POINTER_H, 0)?;
    rf.set_bit(REG_DMA_CTRL, DMA_CTRL_FIFO_RESET_BIT, true)?;
    rf.set_bit(REG_DMA_CTRL, DMA_CTRL_ENABLE_BIT, true)?;
    Ok(())
  }

  fn disable(&self) -> Result<(), RegisterError> {
    disarm_engine(&self.rfpkt, self.link_index)
  }

  pub fn link_index(&self) -> usize {
    self.link_index
  }

  pub fn data_buffer(&self) -> DmaBuffer {
    self.data_buffer
  }

  pub fn desc_buffer(&self) -> DmaBuffer {
    self.desc_buffer
  }

  pub fn transfer_size(&self) -> usize {
    self.transfer_size
  }

  pub fn is_enabled(&self) -> Result<bool, CriError> {
    Ok(self.rfpkt.get_bit(REG_DMA_CTRL, DMA_CTRL_ENABLE_BIT)?)
  }

  /// Transfers in flight
  pub fn is_busy(&self) -> Result<bool, CriError> {
    Ok(self.rfpkt.get_bit(REG_DMA_CTRL, DMA_CTRL_BUSY_BIT)?)
  }

  /// Byte offset in the data ring up to which the
  /// engine has written
  pub fn data_offset(&self) -> Result<u64, CriError> {
    let ptr = self.rfpkt.get_reg_u64(REG_EBDM_HW_WRITE_POINTER_L, REG_EBDM_HW_WRITE_POINTER_H)?;
    Ok(ptr & (self.data_buffer.size() - 1))
  }

  /// Index of the next descriptor the engine will write
  pub fn desc_index(&self) -> Result<u64, CriError> {
    let ptr = self.rfpkt.get_reg_u64(REG_RBDM_HW_WRITE_POINTER_L, REG_RBDM_HW_WRITE_POINTER_H)?;
    Ok((ptr & (self.desc_buffer.size() - 1)) / DMA_DESC_ENTRY_SIZE)
  }

  /// Hand consumed ring space back to the engine
  ///
  /// The engine stalls (and counts data/desc buffer stall
  /// cycles) when its write pointers would pass these.
  ///
  /// # Arguments
  ///
  /// * data_offset : byte offset in the data ring, multiple
  ///                 of the transfer size
  /// * desc_offset : byte offset in the descriptor ring,
  ///                 multiple of the descriptor size
  pub fn set_sw_read_pointers(&mut self, data_offset : u64, desc_offset : u64) -> Result<(), CriError> {
    if data_offset >= self.data_buffer.size() || data_offset % self.transfer_size as u64 != 0 {
      return Err(CriError::InvalidReadPointer(data_offset));
    }
    if desc_offset >= self.desc_buffer.size() || desc_offset % DMA_DESC_ENTRY_SIZE != 0 {
      return Err(CriError::InvalidReadPointer(desc_offset));
    }
    self.rfpkt.set_reg_u64(REG_EBDM_SW_READ_POINTER_L, REG_EBDM_SW_READ_POINTER_H, data_offset)?;
    self.rfpkt.set_reg_u64(REG_RBDM_SW_READ_POINTER_L, REG_RBDM_SW_READ_POINTER_H, desc_offset)?;
    Ok(())
  }
}

impl Drop for DmaChannel {
  fn drop(&mut self) {
    match self.disable() {
      Err(err) => error!("Unable to disarm DMA engine of link {}! {}", self.link_index, err),
      Ok(_)    => debug!("DMA engine of link {} disarmed", self.link_index)
    }
  }
}

impl fmt::Display for DmaChannel {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = format!("<DmaChannel: link {}", self.link_index);
    repr += &(format!("\n  data buffer   : {}", self.data_buffer));
    repr += &(format!("\n  desc buffer   : {}", self.desc_buffer));
    repr += &(format!("\n  transfer size : {} bytes>", self.transfer_size));
    write!(f, "{}", repr)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn buffer_log_size_bounds() {
    assert_eq!(DmaBuffer::new(0x1000, 6).validate(), Err(CriError::InvalidBufferLogSize(6)));
    assert_eq!(DmaBuffer::new(0x1000, 48).validate(), Err(CriError::InvalidBufferLogSize(48)));
    assert!(DmaBuffer::new(0x1000, 7).validate().is_ok());
    assert!(DmaBuffer::new(0x1000, 16).validate().is_ok());
  }

  #[test]
  fn buffer_alignment() {
    assert_eq!(DmaBuffer::new(0x1040, 10).validate(), Err(CriError::MisalignedBuffer(0x1040)));
    assert!(DmaBuffer::new(0x1080, 10).validate().is_ok());
  }

  #[test]
  fn buffer_must_not_wrap_address_space() {
    let buf = DmaBuffer::new(u64::MAX - 127, 10);
    assert_eq!(buf.validate(), Err(CriError::BufferWrapsAddressSpace(u64::MAX - 127)));
    assert!(buf.validate().unwrap_err().is_usage_error());
  }

  #[test]
  fn buffer_pair() {
    let data = DmaBuffer::new(0x10_0000, 16);
    assert!(DmaBuffer::validate_pair(&data, &DmaBuffer::new(0x11_0000, 10)).is_ok());
    assert_eq!(DmaBuffer::validate_pair(&data, &DmaBuffer::new(0x10_8000, 10)),
               Err(CriError::BufferOverlap));
    assert_eq!(DmaBuffer::validate_pair(&data, &DmaBuffer::new(0x11_0000, 5)),
               Err(CriError::InvalidBufferLogSize(5)));
  }

  #[test]
  fn buffer_overlap() {
    let data = DmaBuffer::new(0x10_0000, 16);
    assert!(data.overlaps(&DmaBuffer::new(0x10_8000, 10)));
    assert!(data.overlaps(&DmaBuffer::new(0x0f_ff00, 10)));
    assert!(!data.overlaps(&DmaBuffer::new(0x11_0000, 10)));
    assert!(!data.overlaps(&DmaBuffer::new(0x0f_fc00, 10)));
  }
}
