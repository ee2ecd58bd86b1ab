//! The CRI board as a whole
//!
//! Owns the BAR mapping, reads the global registers and
//! hands out link controllers.

use std::fmt;
use std::sync::Arc;

use crate::errors::{
    CriError,
    RegisterError,
};
use crate::link::CriLink;
use crate::memory::{
    MmapBar,
    PciBar,
    RegisterFile,
    SimBar,
    SIZEOF_U32,
};
use crate::registers::*;

pub struct CriDevice {
  bar  : Arc<dyn PciBar>,
  rfg  : RegisterFile,
}

impl CriDevice {

  pub fn new(bar : Arc<dyn PciBar>) -> Self {
    let rfg = RegisterFile::new(&bar, 0);
    Self {
      bar,
      rfg,
    }
  }

  /// Map the BAR of a board, see `MmapBar::open`
  ///
  /// Only the global window and the link windows are
  /// mapped, so this works for /dev/uioN (which reports a
  /// size of 0) as well as for sysfs resource files.
  pub fn open(path : &str) -> Result<Self, CriError> {
    let bar = MmapBar::open(path, Some(BAR_WORDS * SIZEOF_U32))?;
    Ok(Self::new(Arc::new(bar)))
  }

  /// A board without hardware behind it
  ///
  /// The register image reports n_links links and treats
  /// the pulse bits like the firmware does. The `SimBar` is
  /// returned as well, to play the hardware side.
  pub fn simulated(n_links : usize) -> (Self, Arc<SimBar>) {
    let sim = Arc::new(SimBar::new(BAR_WORDS));
    sim.poke_reg(REG_N_CHANNELS, n_links.min(MAX_LINKS) as u32);
    for link in 0..MAX_LINKS {
      sim.add_self_clearing(pkt_base_addr(link) + REG_DMA_CTRL, 1 << DMA_CTRL_FIFO_RESET_BIT);
      sim.add_self_clearing(gtx_base_addr(link) + REG_GTX_MC_PGEN_CFG_H, 1 << PGEN_CFG_H_MC_PENDING_RST_BIT);
    }
    let bar : Arc<dyn PciBar> = sim.clone();
    (Self::new(bar), sim)
  }

  pub(crate) fn bar(&self) -> &Arc<dyn PciBar> {
    &self.bar
  }

  pub fn hardware_version(&self) -> Result<u16, RegisterError> {
    let info = self.rfg.get_reg(REG_HARDWARE_INFO)?;
    Ok((info & 0xFFFF) as u16)
  }

  pub fn board_type(&self) -> Result<u16, RegisterError> {
    let info = self.rfg.get_reg(REG_HARDWARE_INFO)?;
    Ok((info >> 16) as u16)
  }

  /// Unix time of the firmware build
  pub fn build_date(&self) -> Result<u64, RegisterError> {
    self.rfg.get_reg_u64(REG_BUILD_DATE_L, REG_BUILD_DATE_H)
  }

  pub fn build_revision(&self) -> Result<u32, RegisterError> {
    self.rfg.get_reg(REG_BUILD_REV_0)
  }

  /// Links the firmware actually implements, never
  /// more than the address decoder provides
  pub fn number_of_hw_links(&self) -> Result<usize, RegisterError> {
    let n = (self.rfg.get_reg(REG_N_CHANNELS)? & 0xFF) as usize;
    if n > MAX_LINKS {
      warn!("Firmware reports {} links, but only {} can be addressed!", n, MAX_LINKS);
      return Ok(MAX_LINKS);
    }
    Ok(n)
  }

  pub fn link(&self, link_index : usize) -> Result<CriLink, CriError> {
    CriLink::new(link_index, self)
  }

  /// Controllers for all links of the board
  pub fn links(&self) -> Result<Vec<CriLink>, CriError> {
    let n_links = self.number_of_hw_links()?;
    let mut links = Vec::<CriLink>::with_capacity(n_links);
    for idx in 0..n_links {
      links.push(self.link(idx)?);
    }
    Ok(links)
  }
}

impl fmt::Display for CriDevice {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = String::from("<CriDevice:");
    match self.hardware_version() {
      Ok(ver)  => repr += &(format!("\n  hardware version : {}", ver)),
      Err(err) => repr += &(format!("\n  hardware version : {}", err)),
    }
    match self.board_type() {
      Ok(bt)   => repr += &(format!("\n  board type       : 0x{:04x}", bt)),
      Err(err) => repr += &(format!("\n  board type       : {}", err)),
    }
    match self.build_date() {
      Ok(date) => {
        let date_str = chrono::DateTime::from_timestamp(date as i64, 0)
          .map(|d| d.to_rfc3339())
          .unwrap_or(format!("{}", date));
        repr += &(format!("\n  build date       : {}", date_str));
      }
      Err(err) => repr += &(format!("\n  build date       : {}", err)),
    }
    match self.build_revision() {
      Ok(rev)  => repr += &(format!("\n  build revision   : {:08x}", rev)),
      Err(err) => repr += &(format!("\n  build revision   : {}", err)),
    }
    match self.number_of_hw_links() {
      Ok(n)    => repr += &(format!("\n  links            : {}", n)),
      Err(err) => repr += &(format!("\n  links            : {}", err)),
    }
    write!(f, "{}>", repr)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn simulated_device_reports_links() {
    let (dev, sim) = CriDevice::simulated(3);
    assert_eq!(dev.number_of_hw_links().unwrap(), 3);
    assert_eq!(dev.links().unwrap().len(), 3);
    sim.poke_reg(REG_N_CHANNELS, 200);
    assert_eq!(dev.number_of_hw_links().unwrap(), MAX_LINKS);
  }

  #[test]
  fn open_maps_all_link_windows() {
    // a character device like /dev/uio0 reports size 0
    let mut path = std::env::temp_dir();
    path.push(format!("cri-empty-bar-{}", std::process::id()));
    std::fs::File::create(&path).unwrap();
    let dev = CriDevice::open(&path.to_string_lossy()).unwrap();
    assert_eq!(dev.bar().size(), BAR_WORDS * SIZEOF_U32);
    drop(dev);
    let _ = std::fs::remove_file(&path);
  }

  #[test]
  fn hardware_info_fields() {
    let (dev, sim) = CriDevice::simulated(1);
    sim.poke_reg(REG_HARDWARE_INFO, 0x4352_0005);
    sim.poke_reg(REG_BUILD_DATE_L, 1_700_000_000);
    assert_eq!(dev.hardware_version().unwrap(), 5);
    assert_eq!(dev.board_type().unwrap(), 0x4352);
    assert_eq!(dev.build_date().unwrap(), 1_700_000_000);
    let repr = format!("{}", dev);
    assert!(repr.contains("hardware version : 5"));
  }
}
