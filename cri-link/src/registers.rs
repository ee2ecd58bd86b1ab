//! Registers of the CRI board are accessed through
//! BAR 0 of the PCIe device. All registers are 32bit
//! and addressed in words, the byte offset on the bus
//! is the word address * 4.
//!
//! The address space is split into 1024-word windows.
//! Window 0 holds the global registers, window n+1
//! belongs to link n. Each link window is split into
//! two banks:
//!
//! ```text
//! [ (n+1) << CH_ADDR_SEL                      ] packetizer (pkt) domain
//! [ (n+1) << CH_ADDR_SEL + 1 << DMA_ADDR_SEL  ] transceiver (gtx) domain
//! ```
//!
//! If a register appears more than once below, it holds
//! different fields in different bits.

/// log2 of the per link address window in words
pub const CH_ADDR_SEL  : usize = 10;
/// log2 of the offset of the gtx bank within a link window
pub const DMA_ADDR_SEL : usize = 9;
/// Number of link windows the address decoder provides
pub const MAX_LINKS    : usize = 8;
/// Size of a single register bank in words
pub const BANK_WORDS   : usize = 1 << DMA_ADDR_SEL;
/// Words needed to map the global window and all links
pub const BAR_WORDS    : usize = (MAX_LINKS + 1) << CH_ADDR_SEL;

/// Word address of the packetizer bank of a link
pub fn pkt_base_addr(link_index : usize) -> usize {
  (link_index + 1) << CH_ADDR_SEL
}

/// Word address of the transceiver bank of a link
pub fn gtx_base_addr(link_index : usize) -> usize {
  pkt_base_addr(link_index) + (1 << DMA_ADDR_SEL)
}

//========== Clocks =====================
//
//=======================================

/// packetizer domain clock in Hz
pub const PKT_CLK_HZ : u64 = 250_000_000;
/// transceiver domain clock in Hz
pub const GTX_CLK_HZ : f64 = 161.1328125e6;

/// The perf interval register is 32bit wide, at PKT_CLK_HZ
/// this is a little more than 17s.
pub const PERF_INTERVAL_MAX_MS : u32 = 17000;

//========== Global Registers ===========
//
//=======================================

pub const REG_HARDWARE_INFO : usize = 0x00; //[15:0] hardware revision, [31:16] board type
pub const REG_N_CHANNELS    : usize = 0x01; //[7:0] number of links in this build
pub const REG_BUILD_DATE_L  : usize = 0x02; //[31:0] unix time of the firmware build
pub const REG_BUILD_DATE_H  : usize = 0x03; //[31:0]
pub const REG_BUILD_REV_0   : usize = 0x04; //[31:0] firmware git hash, lowest word

//========== Packetizer Registers ========
//         (per link, pkt domain)
//=======================================

/// DMA engine control
pub const REG_DMA_CTRL               : usize = 0x00;
pub const DMA_CTRL_ENABLE_BIT        : u32   = 0;  //rw  1 arms the DMA engine
pub const DMA_CTRL_FIFO_RESET_BIT    : u32   = 1;  //w   pulse, self clearing
pub const DMA_CTRL_BUSY_BIT          : u32   = 31; //r   transfer in flight

/// DMA transfer unit in 32bit words
pub const REG_DMA_TRANSFER_SIZE      : usize = 0x01;

/// event (data) buffer descriptor manager
pub const REG_EBDM_BUFFER_ADDR_L     : usize = 0x02; //[31:0]  bus address
pub const REG_EBDM_BUFFER_ADDR_H     : usize = 0x03; //[31:0]
pub const REG_EBDM_BUFFER_LOG_SIZE   : usize = 0x04; //[5:0]   log2 of the size in bytes
/// report (descriptor) buffer descriptor manager
pub const REG_RBDM_BUFFER_ADDR_L     : usize = 0x05;
pub const REG_RBDM_BUFFER_ADDR_H     : usize = 0x06;
pub const REG_RBDM_BUFFER_LOG_SIZE   : usize = 0x07;

/// software read pointers, written by the consumer
pub const REG_EBDM_SW_READ_POINTER_L : usize = 0x08;
pub const REG_EBDM_SW_READ_POINTER_H : usize = 0x09;
pub const REG_RBDM_SW_READ_POINTER_L : usize = 0x0a;
pub const REG_RBDM_SW_READ_POINTER_H : usize = 0x0b;

/// hardware write pointers, advanced by the DMA engine
pub const REG_EBDM_HW_WRITE_POINTER_L : usize = 0x0c;
pub const REG_EBDM_HW_WRITE_POINTER_H : usize = 0x0d;
pub const REG_RBDM_HW_WRITE_POINTER_L : usize = 0x0e;
pub const REG_RBDM_HW_WRITE_POINTER_H : usize = 0x0f;

/// scratch register to check bus access
pub const REG_TESTREG_DMA            : usize = 0x10;

/// performance counters, latched and reset by the
/// hardware at the end of each interval
pub const REG_PERF_INTERVAL          : usize = 0x20; //[31:0] rw interval in pkt cycles
pub const REG_PERF_DMA_STALL         : usize = 0x21; //[31:0] packetizer could not send (pkt cycles)
pub const REG_PERF_EBUF_STALL        : usize = 0x22; //[31:0] stall from data buffer pointer match
pub const REG_PERF_RBUF_STALL        : usize = 0x23; //[31:0] stall from descriptor buffer pointer match
pub const REG_PERF_N_EVENTS          : usize = 0x24; //[31:0] microslices sent in interval

//========== Transceiver Registers =======
//         (per link, gtx domain)
//=======================================

pub const REG_GTX_DATAPATH_CFG       : usize = 0x00;
pub const DATAPATH_CFG_SRC_MASK      : u32   = 0x3; //[1:0] data source select
pub const DATAPATH_CFG_READY_BIT     : u32   = 2;   //[2]   ready for data

/// scratch register to check bus access
pub const REG_TESTREG_DATA           : usize = 0x01;

pub const REG_GTX_MC_PGEN_CFG_L      : usize = 0x02;
pub const PGEN_CFG_ID_MASK           : u32   = 0x0000_FFFF; //[15:0]  equipment id
pub const PGEN_CFG_RATE_MASK         : u32   = 0xFFFF_0000; //[31:16] rate, 0xFFFF is off
pub const PGEN_CFG_RATE_SHIFT        : u32   = 16;

pub const REG_GTX_MC_PGEN_CFG_H      : usize = 0x03;
pub const PGEN_CFG_H_MC_PENDING_RST_BIT : u32 = 0; //[0] pulse, self clearing

/// number of microslices generated but not yet sent
pub const REG_GTX_MC_PGEN_MC_PENDING : usize = 0x04;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn link_windows_are_disjoint() {
    // every bank is [base, base + BANK_WORDS)
    let mut banks = Vec::<(usize, usize)>::new();
    for link in 0..MAX_LINKS {
      banks.push((pkt_base_addr(link), pkt_base_addr(link) + BANK_WORDS));
      banks.push((gtx_base_addr(link), gtx_base_addr(link) + BANK_WORDS));
    }
    for (i, a) in banks.iter().enumerate() {
      for (j, b) in banks.iter().enumerate() {
        if i == j {
          continue;
        }
        assert!(a.1 <= b.0 || b.1 <= a.0, "banks {a:?} and {b:?} overlap");
      }
    }
  }

  #[test]
  fn global_window_is_not_a_link() {
    assert_eq!(pkt_base_addr(0), 1024);
    assert_eq!(gtx_base_addr(0), 1536);
    for link in 0..MAX_LINKS {
      assert!(pkt_base_addr(link) >= 1 << CH_ADDR_SEL);
      assert!(gtx_base_addr(link) + BANK_WORDS <= BAR_WORDS);
    }
  }

  #[test]
  fn perf_interval_fits_register() {
    let cycles = PERF_INTERVAL_MAX_MS as u64 * (PKT_CLK_HZ / 1000);
    assert!(cycles <= u32::MAX as u64);
  }
}
