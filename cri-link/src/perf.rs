//! Performance snapshot of a link
//!
//! The counters are latched by the hardware at the end of
//! every averaging interval. Two snapshots taken within one
//! interval will show the same values. Derived rates are
//! always computed against the interval stored in the
//! snapshot itself.

use std::fmt;

use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::registers::PKT_CLK_HZ;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPerf {
  /// length of the averaging interval in pkt cycles
  pub pkt_cycle_cnt  : u32,
  /// length of the averaging interval in gtx cycles
  pub gtx_cycle_cnt  : u32,
  /// packetizer could not send data (pkt cycles)
  pub dma_stall      : u32,
  /// packetizer stall from data buffer pointer match (pkt cycles)
  pub data_buf_stall : u32,
  /// packetizer stall from descriptor buffer pointer match (pkt cycles)
  pub desc_buf_stall : u32,
  /// number of events (microslices) sent
  pub events         : u32,
  /// backpressure from packetizer input fifo (gtx cycles).
  /// The firmware does not provide this counter yet, it is
  /// always 0.
  pub din_full_gtx   : u32,
}

impl LinkPerf {
  pub fn new() -> Self {
    Self::default()
  }

  /// Interval in seconds, 0 if unknown
  pub fn interval_secs(&self) -> f64 {
    self.pkt_cycle_cnt as f64 / PKT_CLK_HZ as f64
  }

  fn fraction(&self, cycles : u32) -> f64 {
    if self.pkt_cycle_cnt == 0 {
      return 0.0;
    }
    cycles as f64 / self.pkt_cycle_cnt as f64
  }

  /// Events per second within the interval
  pub fn event_rate(&self) -> f64 {
    if self.pkt_cycle_cnt == 0 {
      return 0.0;
    }
    self.events as f64 / self.interval_secs()
  }

  pub fn dma_stall_fraction(&self) -> f64 {
    self.fraction(self.dma_stall)
  }

  pub fn data_buf_stall_fraction(&self) -> f64 {
    self.fraction(self.data_buf_stall)
  }

  pub fn desc_buf_stall_fraction(&self) -> f64 {
    self.fraction(self.desc_buf_stall)
  }
}

impl fmt::Display for LinkPerf {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = String::from("<LinkPerf:");
    repr += &(format!("\n  interval       : {} pkt cycles ({:.3} s)", self.pkt_cycle_cnt, self.interval_secs()));
    repr += &(format!("\n  gtx cycles     : {}", self.gtx_cycle_cnt));
    repr += &(format!("\n  events         : {} ({:.1} Hz)", self.events, self.event_rate()));
    repr += &(format!("\n  dma stall      : {} ({:.2} %)", self.dma_stall, 100.0*self.dma_stall_fraction()));
    repr += &(format!("\n  data buf stall : {} ({:.2} %)", self.data_buf_stall, 100.0*self.data_buf_stall_fraction()));
    repr += &(format!("\n  desc buf stall : {} ({:.2} %)", self.desc_buf_stall, 100.0*self.desc_buf_stall_fraction()));
    repr += &(format!("\n  din full (gtx) : {} [not implemented]>", self.din_full_gtx));
    write!(f, "{}", repr)
  }
}

/// A snapshot tagged with where and when it was taken,
/// ready to be handed to a monitoring sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkPerfMetric {
  pub timestamp  : DateTime<Utc>,
  pub link_index : usize,
  pub perf       : LinkPerf,
}

impl LinkPerfMetric {
  pub fn new(link_index : usize, perf : LinkPerf) -> Self {
    Self {
      timestamp  : Utc::now(),
      link_index,
      perf,
    }
  }

  pub fn to_json(&self) -> Result<String, serde_json::Error> {
    serde_json::to_string(self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rates_use_own_interval() {
    let mut perf = LinkPerf::new();
    // half a second
    perf.pkt_cycle_cnt = 125_000_000;
    perf.events        = 500;
    perf.dma_stall     = 12_500_000;
    assert!((perf.interval_secs() - 0.5).abs() < 1e-9);
    assert!((perf.event_rate() - 1000.0).abs() < 1e-6);
    assert!((perf.dma_stall_fraction() - 0.1).abs() < 1e-9);
  }

  #[test]
  fn zero_interval_gives_zero_rates() {
    let mut perf = LinkPerf::new();
    perf.events         = 42;
    perf.data_buf_stall = 7;
    assert_eq!(perf.event_rate(), 0.0);
    assert_eq!(perf.data_buf_stall_fraction(), 0.0);
  }

  #[test]
  fn metric_to_json() {
    let mut perf = LinkPerf::new();
    perf.events  = 17;
    let metric   = LinkPerfMetric::new(2, perf);
    let json     = metric.to_json().unwrap();
    let back : LinkPerfMetric = serde_json::from_str(&json).unwrap();
    assert_eq!(back, metric);
    assert!(json.contains("\"link_index\":2"));
  }
}
