//! Readout link control for the CRI PCIe board
//!
//! The board streams detector data via DMA into ring buffers
//! in host memory, one DMA engine per link. This crate maps
//! the registers of the board and drives the links: DMA
//! channel lifecycle, flow control, data source selection
//! and the performance counters.
//!
//! ```no_run
//! use cri_link::prelude::*;
//!
//! let dev      = CriDevice::open("/sys/bus/pci/devices/0000:01:00.0/resource0").unwrap();
//! let mut link = dev.link(0).unwrap();
//! link.init_dma(DmaBuffer::new(0x1_0000_0000, 24),
//!               DmaBuffer::new(0x1_0100_0000, 16)).unwrap();
//! link.set_data_source(DataSource::User).unwrap();
//! link.enable_readout().unwrap();
//! println!("{}", link.link_perf().unwrap());
//! ```
pub mod registers;
pub mod errors;
pub mod memory;
pub mod dma;
pub mod perf;
pub mod device;
pub mod link;
pub mod monitoring;

#[macro_use] extern crate log;

pub mod prelude {
  pub use crate::device::CriDevice;
  pub use crate::dma::{
      DmaBuffer,
      DmaChannel,
  };
  pub use crate::errors::{
      CriError,
      RegisterError,
  };
  pub use crate::link::{
      CriLink,
      DataSource,
  };
  pub use crate::perf::{
      LinkPerf,
      LinkPerfMetric,
  };
}
