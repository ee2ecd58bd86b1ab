//! Thread control structures

use std::fmt;

/// Send runtime information
/// to threads via shared memory
/// (Arc(Mutex)
#[derive(Default, Debug)]
pub struct ThreadControl {
  /// Stop ALL threads
  pub stop_flag                : bool,
  /// alive indicator for the link monitoring thread
  pub thread_monitoring_active : bool,
  /// Number of perf snapshots the monitoring
  /// thread has sent so far
  pub n_moni_sent              : u64,
}

impl ThreadControl {
  pub fn new() -> Self {
    Self {
      stop_flag                : false,
      thread_monitoring_active : false,
      n_moni_sent              : 0,
    }
  }
}

impl fmt::Display for ThreadControl {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = String::from("<ThreadControl:");
    repr        += "\n    -- program status:";
    repr        += &(format!("\n  stop flag      : {}", self.stop_flag));
    repr        += "\n    -- reported thread activity:";
    repr        += &(format!("\n  monitoring     : {}", self.thread_monitoring_active));
    repr        += &(format!("\n  moni sent      : {}>", self.n_moni_sent));
    write!(f, "{}", repr)
  }
}
