//! Error types of the link controller
//!
//! `RegisterError` means the bus transaction itself failed,
//! `CriError` wraps it and adds the usage errors (caller broke
//! the contract) and unexpected hardware states.

use std::error::Error;
use std::fmt;

/// Failed bus access
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum RegisterError {
  /// The BAR mapping behind the register file is gone
  Detached,
  /// Byte offset outside of the mapped window
  OutOfBounds { offset : usize },
  MMapFail,
  /// The bus did not accept a write
  WriteFault,
}

impl fmt::Display for RegisterError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let etype : String;
    match self {
      RegisterError::Detached => {
        etype = String::from("Detached");
      },
      RegisterError::OutOfBounds { offset } => {
        etype = format!("OutOfBounds (offset 0x{:x})", offset);
      },
      RegisterError::MMapFail => {
        etype = String::from("MMapFail");
      },
      RegisterError::WriteFault => {
        etype = String::from("WriteFault");
      },
    }
    write!(f, "<RegisterError: {}>", etype)
  }
}

impl Error for RegisterError {
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum CriError {
  /// dma() called before init_dma()
  NoDmaChannel,
  /// pattern generator rate outside of [0,1]
  InvalidPgenRate(f32),
  /// buffer log2 size outside of what the engine supports
  InvalidBufferLogSize(u32),
  /// buffer bus address not aligned to the DMA transfer size
  MisalignedBuffer(u64),
  /// buffer would run past the end of the 64bit address space
  BufferWrapsAddressSpace(u64),
  /// buffer size (bytes) not a power of two
  BufferSizeNotPowerOfTwo(u64),
  /// data and descriptor buffer share memory
  BufferOverlap,
  LinkIndexOutOfRange(usize),
  /// software read pointer outside of its ring
  InvalidReadPointer(u64),
  /// the DMA engine of the link is already armed
  DmaEngineBusy,
  /// reserved value in the data source field
  UnknownDataSource(u32),
  /// data source name not one of disable, user, pgen
  InvalidDataSourceName,
  Register(RegisterError),
}

impl CriError {
  /// True if the caller violated the contract of the
  /// controller, as opposed to a bus or hardware issue.
  pub fn is_usage_error(&self) -> bool {
    match self {
      CriError::NoDmaChannel
      | CriError::InvalidPgenRate(_)
      | CriError::InvalidBufferLogSize(_)
      | CriError::MisalignedBuffer(_)
      | CriError::BufferWrapsAddressSpace(_)
      | CriError::BufferSizeNotPowerOfTwo(_)
      | CriError::BufferOverlap
      | CriError::InvalidDataSourceName
      | CriError::LinkIndexOutOfRange(_)
      | CriError::InvalidReadPointer(_) => true,
      CriError::DmaEngineBusy
      | CriError::UnknownDataSource(_)
      | CriError::Register(_) => false,
    }
  }
}

impl fmt::Display for CriError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let etype : String;
    match self {
      CriError::NoDmaChannel             => etype = String::from("DMA channel not initialized"),
      CriError::InvalidPgenRate(rate)    => etype = format!("pattern generator rate {} not in [0,1]", rate),
      CriError::InvalidBufferLogSize(sz) => etype = format!("invalid buffer log2 size {}", sz),
      CriError::MisalignedBuffer(addr)   => etype = format!("buffer at 0x{:x} not aligned to DMA transfer size", addr),
      CriError::BufferWrapsAddressSpace(addr) => etype = format!("buffer at 0x{:x} wraps the address space", addr),
      CriError::BufferSizeNotPowerOfTwo(sz)   => etype = format!("buffer size {} is not a power of two", sz),
      CriError::BufferOverlap            => etype = String::from("data and descriptor buffer overlap"),
      CriError::InvalidDataSourceName    => etype = String::from("data source name not one of disable, user, pgen"),
      CriError::LinkIndexOutOfRange(idx) => etype = format!("link index {} out of range", idx),
      CriError::InvalidReadPointer(ptr)  => etype = format!("read pointer 0x{:x} outside of ring buffer", ptr),
      CriError::DmaEngineBusy            => etype = String::from("DMA engine already enabled"),
      CriError::UnknownDataSource(val)   => etype = format!("unknown data source {}", val),
      CriError::Register(err)            => etype = format!("register access failed {}", err),
    }
    write!(f, "<CriError: {}>", etype)
  }
}

impl Error for CriError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    match self {
      CriError::Register(err) => Some(err),
      _                       => None,
    }
  }
}

impl From<RegisterError> for CriError {
  fn from(err : RegisterError) -> Self {
    CriError::Register(err)
  }
}
