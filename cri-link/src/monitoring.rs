use std::time::{
    Duration,
    Instant
};
use std::sync::{
    Arc,
    Mutex,
};

use std::thread;

use crossbeam_channel::Sender;

use cri_lib::ThreadControl;

use crate::link::CriLink;
use crate::perf::LinkPerfMetric;

/// Gather the perf snapshots of a set of links and pass
/// them on over a channel
///
/// Runs until the stop flag in thread_control is set.
/// Snapshots taken faster than the hardware interval
/// will repeat the same counter values.
///
/// # Arguments:
///
/// * links          - the links to watch
/// * ch             - should connect to a monitoring sink
/// * moni_interval  - poll the counters this often
/// * verbose        - print the snapshots for debugging
/// * thread_control - stop flag and bookkeeping
pub fn monitor_links(links          : &[CriLink],
                     ch             : &Sender<LinkPerfMetric>,
                     moni_interval  : Duration,
                     verbose        : bool,
                     thread_control : Arc<Mutex<ThreadControl>>) {
  let sleep_time     = moni_interval.min(Duration::from_millis(100));
  let mut moni_timer = Instant::now();
  let mut first      = true;
  match thread_control.lock() {
    Ok(mut tc) => tc.thread_monitoring_active = true,
    Err(err)   => error!("Can't acquire lock! {err}"),
  }
  loop {
    match thread_control.lock() {
      Ok(tc) => {
        if tc.stop_flag {
          info!("Received stop signal. Will stop thread!");
          break;
        }
      },
      Err(err) => {
        trace!("Can't acquire lock! {err}");
      },
    }

    if first || moni_timer.elapsed() >= moni_interval {
      first = false;
      let mut n_sent = 0u64;
      for link in links {
        let perf = match link.link_perf() {
          Err(err) => {
            warn!("Can not read perf counters of link {}! {}", link.link_index(), err);
            continue;
          }
          Ok(perf) => perf
        };
        if verbose {
          println!("link {} {}", link.link_index(), perf);
        }
        let metric = LinkPerfMetric::new(link.link_index(), perf);
        match ch.try_send(metric) {
          Err(err) => {error!("Issue sending LinkPerfMetric {:?}", err)},
          Ok(_)    => {
            debug!("Send LinkPerfMetric successfully!");
            n_sent += 1;
          }
        }
      }
      if let Ok(mut tc) = thread_control.lock() {
        tc.n_moni_sent += n_sent;
      }
      moni_timer = Instant::now();
    }
    thread::sleep(sleep_time);
  }
  match thread_control.lock() {
    Ok(mut tc) => tc.thread_monitoring_active = false,
    Err(err)   => error!("Can't acquire lock! {err}"),
  }
}
