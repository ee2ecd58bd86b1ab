//! Controller for a single readout link
//!
//! A link has two register banks, the packetizer (pkt) bank
//! with the DMA engine and the performance counters and the
//! transceiver (gtx) bank with the datapath configuration
//! and the pattern generator. For the addresses, see
//! `registers.rs`.
//!
//! Configuration writes are read-modify-write sequences on
//! shared registers. They need `&mut self`, but nothing
//! protects them against another process writing the same
//! registers.

use std::fmt;
use std::str::FromStr;

use cri_lib::LinkSettings;

use crate::device::CriDevice;
use crate::dma::{
    disarm_engine,
    DmaBuffer,
    DmaChannel,
    DMA_TRANSFER_SIZE,
};
use crate::errors::CriError;
use crate::memory::RegisterFile;
use crate::perf::LinkPerf;
use crate::registers::*;

/// The firmware has no gtx interval register yet, the
/// gtx cycle count in the perf snapshot is fixed to this
pub const GTX_PERF_INTERVAL_PLACEHOLDER : u32 = 1;

/// Where the link takes its data from
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataSource {
  Disable = 0,
  /// data from the detector frontend
  User    = 1,
  /// on-board pattern generator
  Pgen    = 2,
}

impl DataSource {
  pub fn to_u32(&self) -> u32 {
    *self as u32
  }

  pub fn from_u32(value : u32) -> Option<Self> {
    match value {
      0 => Some(DataSource::Disable),
      1 => Some(DataSource::User),
      2 => Some(DataSource::Pgen),
      _ => None
    }
  }
}

impl fmt::Display for DataSource {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let repr = match self {
      DataSource::Disable => "disable",
      DataSource::User    => "   user",
      DataSource::Pgen    => "   pgen",
    };
    write!(f, "{}", repr)
  }
}

impl FromStr for DataSource {
  type Err = String;

  fn from_str(s : &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "disable" | "disabled" => Ok(DataSource::Disable),
      "user"                 => Ok(DataSource::User),
      "pgen"                 => Ok(DataSource::Pgen),
      other                  => Err(format!("Unknown data source '{}', use disable, user or pgen", other)),
    }
  }
}

/// Register value for a pattern generator rate
///
/// The hardware wants the fraction of idle time, 0xFFFF
/// is no data at all, 0 is full speed.
pub fn pgen_rate_reg_value(rate : f32) -> Result<u16, CriError> {
  if !(0.0..=1.0).contains(&rate) {
    return Err(CriError::InvalidPgenRate(rate));
  }
  let value = ((1.0 - rate as f64) * u16::MAX as f64).round();
  Ok(value as u16)
}

pub struct CriLink {
  link_index                 : usize,
  rfpkt                      : RegisterFile,
  rfgtx                      : RegisterFile,
  dma_channel                : Option<DmaChannel>,
  reg_perf_interval_cached   : u32,
  reg_gtx_perf_interval_cached : u32,
}

impl CriLink {

  /// Set up the register banks of a link
  ///
  /// Reads the current perf interval once, it is needed
  /// for every rate computation.
  pub fn new(link_index : usize, device : &CriDevice) -> Result<Self, CriError> {
    if link_index >= MAX_LINKS {
      return Err(CriError::LinkIndexOutOfRange(link_index));
    }
    let rfpkt = RegisterFile::new(device.bar(), pkt_base_addr(link_index));
    let rfgtx = RegisterFile::new(device.bar(), gtx_base_addr(link_index));
    let reg_perf_interval_cached = rfpkt.get_reg(REG_PERF_INTERVAL)?;
    debug!("Link {} at pkt 0x{:x}, gtx 0x{:x}, perf interval {} cycles",
           link_index, rfpkt.base(), rfgtx.base(), reg_perf_interval_cached);
    Ok(Self {
      link_index,
      rfpkt,
      rfgtx,
      dma_channel                  : None,
      reg_perf_interval_cached,
      reg_gtx_perf_interval_cached : GTX_PERF_INTERVAL_PLACEHOLDER,
    })
  }

  pub fn link_index(&self) -> usize {
    self.link_index
  }

  //////*** DMA ***//////

  /// Arm the DMA engine of this link with two caller
  /// allocated ring buffers.
  ///
  /// An already active channel is torn down first, unless
  /// the new buffers are invalid. Then the call fails and
  /// the running channel stays armed. The buffers must stay
  /// valid until the channel is gone (`deinit_dma`, the next
  /// `init_dma` or dropping the link).
  pub fn init_dma(&mut self, data_buffer : DmaBuffer, desc_buffer : DmaBuffer) -> Result<(), CriError> {
    DmaBuffer::validate_pair(&data_buffer, &desc_buffer)?;
    self.deinit_dma();
    let channel = DmaChannel::new(self.link_index,
                                  self.rfpkt.clone(),
                                  data_buffer,
                                  desc_buffer,
                                  DMA_TRANSFER_SIZE)?;
    self.dma_channel = Some(channel);
    Ok(())
  }

  /// Disarm and drop the DMA channel, if there is one
  pub fn deinit_dma(&mut self) {
    if let Some(channel) = self.dma_channel.take() {
      debug!("Tearing down DMA channel of link {}", self.link_index);
      drop(channel);
    }
  }

  /// Disarm the DMA engine of this link, whoever armed it
  ///
  /// For an engine which is left enabled without a channel
  /// behind it (the owning process died), so `init_dma` fails
  /// with `DmaEngineBusy`. Drops our own channel first, if any.
  /// The buffers of the other session must not be reused
  /// before this returned.
  pub fn force_disarm_dma(&mut self) -> Result<(), CriError> {
    self.deinit_dma();
    warn!("Forcing DMA engine of link {} off", self.link_index);
    disarm_engine(&self.rfpkt, self.link_index)?;
    Ok(())
  }

  pub fn has_dma(&self) -> bool {
    self.dma_channel.is_some()
  }

  pub fn dma(&self) -> Result<&DmaChannel, CriError> {
    self.dma_channel.as_ref().ok_or(CriError::NoDmaChannel)
  }

  pub fn dma_mut(&mut self) -> Result<&mut DmaChannel, CriError> {
    self.dma_channel.as_mut().ok_or(CriError::NoDmaChannel)
  }

  //////*** Flow control ***//////

  pub fn enable_readout(&mut self) -> Result<(), CriError> {
    info!("Enable readout of link {}", self.link_index);
    self.set_ready_for_data(true)
  }

  pub fn disable_readout(&mut self) -> Result<(), CriError> {
    info!("Disable readout of link {}", self.link_index);
    self.set_ready_for_data(false)
  }

  fn set_ready_for_data(&mut self, enable : bool) -> Result<(), CriError> {
    self.rfgtx.set_bit(REG_GTX_DATAPATH_CFG, DATAPATH_CFG_READY_BIT, enable)?;
    Ok(())
  }

  pub fn ready_for_data(&self) -> Result<bool, CriError> {
    Ok(self.rfgtx.get_bit(REG_GTX_DATAPATH_CFG, DATAPATH_CFG_READY_BIT)?)
  }

  //////*** Datapath ***//////

  pub fn set_data_source(&mut self, src : DataSource) -> Result<(), CriError> {
    debug!("Set data source of link {} to {}", self.link_index, src);
    self.rfgtx.set_reg(REG_GTX_DATAPATH_CFG, src.to_u32(), DATAPATH_CFG_SRC_MASK)?;
    Ok(())
  }

  pub fn data_source(&self) -> Result<DataSource, CriError> {
    let dp_cfg = self.rfgtx.get_reg(REG_GTX_DATAPATH_CFG)?;
    let src    = dp_cfg & DATAPATH_CFG_SRC_MASK;
    DataSource::from_u32(src).ok_or(CriError::UnknownDataSource(src))
  }

  pub fn set_testreg_dma(&mut self, data : u32) -> Result<(), CriError> {
    self.rfpkt.set_reg_full(REG_TESTREG_DMA, data)?;
    Ok(())
  }

  pub fn testreg_dma(&self) -> Result<u32, CriError> {
    Ok(self.rfpkt.get_reg(REG_TESTREG_DMA)?)
  }

  pub fn set_testreg_data(&mut self, data : u32) -> Result<(), CriError> {
    self.rfgtx.set_reg_full(REG_TESTREG_DATA, data)?;
    Ok(())
  }

  pub fn testreg_data(&self) -> Result<u32, CriError> {
    Ok(self.rfgtx.get_reg(REG_TESTREG_DATA)?)
  }

  //////*** Pattern Generator Configuration ***//////

  pub fn set_pgen_id(&mut self, eq_id : u16) -> Result<(), CriError> {
    self.rfgtx.set_reg(REG_GTX_MC_PGEN_CFG_L, eq_id as u32, PGEN_CFG_ID_MASK)?;
    Ok(())
  }

  /// Set the pattern generator rate as fraction of the
  /// maximum, rate has to be in [0,1]
  pub fn set_pgen_rate(&mut self, rate : f32) -> Result<(), CriError> {
    let reg_val = pgen_rate_reg_value(rate)?;
    self.rfgtx.set_reg(REG_GTX_MC_PGEN_CFG_L,
                       (reg_val as u32) << PGEN_CFG_RATE_SHIFT,
                       PGEN_CFG_RATE_MASK)?;
    Ok(())
  }

  /// One-shot, the bit clears itself in the firmware
  pub fn reset_pgen_mc_pending(&mut self) -> Result<(), CriError> {
    self.rfgtx.set_bit(REG_GTX_MC_PGEN_CFG_H, PGEN_CFG_H_MC_PENDING_RST_BIT, true)?;
    Ok(())
  }

  pub fn pgen_mc_pending(&self) -> Result<u32, CriError> {
    Ok(self.rfgtx.get_reg(REG_GTX_MC_PGEN_MC_PENDING)?)
  }

  //////*** Performance Counters ***//////

  /// Set the averaging interval in ms (max 17s)
  pub fn set_perf_interval(&mut self, interval_ms : u32) -> Result<(), CriError> {
    let interval_ms = interval_ms.min(PERF_INTERVAL_MAX_MS);
    let cycles = (interval_ms as u64 * (PKT_CLK_HZ / 1000)) as u32;
    self.rfpkt.set_reg_full(REG_PERF_INTERVAL, cycles)?;
    self.reg_perf_interval_cached = cycles;
    Ok(())
  }

  pub fn perf_interval_cycles_pkt(&self) -> u32 {
    self.reg_perf_interval_cached
  }

  pub fn perf_interval_cycles_gtx(&self) -> u32 {
    self.reg_gtx_perf_interval_cached
  }

  /// packetizer could not send data (pkt cycles)
  pub fn dma_stall(&self) -> Result<u32, CriError> {
    Ok(self.rfpkt.get_reg(REG_PERF_DMA_STALL)?)
  }

  /// packetizer stall from data buffer pointer match (pkt cycles)
  pub fn data_buf_stall(&self) -> Result<u32, CriError> {
    Ok(self.rfpkt.get_reg(REG_PERF_EBUF_STALL)?)
  }

  /// packetizer stall from descriptor buffer pointer match (pkt cycles)
  pub fn desc_buf_stall(&self) -> Result<u32, CriError> {
    Ok(self.rfpkt.get_reg(REG_PERF_RBUF_STALL)?)
  }

  pub fn event_count(&self) -> Result<u32, CriError> {
    Ok(self.rfpkt.get_reg(REG_PERF_N_EVENTS)?)
  }

  /// Backpressure from the packetizer input fifo (gtx cycles).
  ///
  /// Not implemented in the firmware yet, always 0.
  pub fn din_full_gtx(&self) -> u32 {
    0
  }

  /// Event rate in Hz over the last interval
  ///
  /// Only meaningful once a full interval has passed after
  /// `set_perf_interval`. An interval of 0 gives 0.
  pub fn event_rate(&self) -> Result<f32, CriError> {
    let n_events = self.event_count()? as f32;
    if self.reg_perf_interval_cached == 0 {
      return Ok(0.0);
    }
    Ok(n_events / (self.reg_perf_interval_cached as f32 / PKT_CLK_HZ as f32))
  }

  pub fn link_perf(&self) -> Result<LinkPerf, CriError> {
    Ok(LinkPerf {
      pkt_cycle_cnt  : self.reg_perf_interval_cached,
      gtx_cycle_cnt  : self.reg_gtx_perf_interval_cached,
      dma_stall      : self.dma_stall()?,
      data_buf_stall : self.data_buf_stall()?,
      desc_buf_stall : self.desc_buf_stall()?,
      events         : self.event_count()?,
      din_full_gtx   : self.din_full_gtx(),
    })
  }

  /// Raw packetizer counters for troubleshooting
  pub fn print_perf_raw(&self) -> Result<String, CriError> {
    let mut repr = String::new();
    repr += &(format!("pkt_interval {}\n", self.rfpkt.get_reg(REG_PERF_INTERVAL)?));
    repr += &(format!("event rate {}\n", self.rfpkt.get_reg(REG_PERF_N_EVENTS)?));
    repr += &(format!("dma stall {}\n", self.rfpkt.get_reg(REG_PERF_DMA_STALL)?));
    repr += &(format!("data buf stall {}\n", self.rfpkt.get_reg(REG_PERF_EBUF_STALL)?));
    repr += &(format!("desc buf stall {}\n", self.rfpkt.get_reg(REG_PERF_RBUF_STALL)?));
    Ok(repr)
  }
}

impl Drop for CriLink {
  fn drop(&mut self) {
    self.deinit_dma();
  }
}

impl fmt::Display for CriLink {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = format!("<CriLink {}:", self.link_index);
    match self.data_source() {
      Ok(src)  => repr += &(format!("\n  data source    : {}", src)),
      Err(err) => repr += &(format!("\n  data source    : {}", err)),
    }
    match self.ready_for_data() {
      Ok(rdy)  => repr += &(format!("\n  ready for data : {}", rdy)),
      Err(err) => repr += &(format!("\n  ready for data : {}", err)),
    }
    repr += &(format!("\n  dma channel    : {}", if self.has_dma() {"armed"} else {"none"}));
    repr += &(format!("\n  perf interval  : {} cycles>", self.reg_perf_interval_cached));
    write!(f, "{}", repr)
  }
}

/// Bring a link into the state described by its
/// settings section
pub fn apply_settings(link : &mut CriLink, settings : &LinkSettings) -> Result<(), CriError> {
  let src = match DataSource::from_str(&settings.data_source) {
    Err(err) => {
      error!("{}", err);
      return Err(CriError::InvalidDataSourceName);
    }
    Ok(src) => src
  };
  // validate before any register is touched
  pgen_rate_reg_value(settings.pgen_rate)?;
  link.disable_readout()?;
  link.set_pgen_id(settings.pgen_id)?;
  link.set_pgen_rate(settings.pgen_rate)?;
  link.set_data_source(src)?;
  if settings.readout_enabled {
    link.enable_readout()?;
  }
  Ok(())
}
