//! # cri-ctl - operator tool for the readout links of a CRI board
//!
//! Inspect and configure single links, watch the performance
//! counters and run a DMA session which discards the data.
//!
use std::process;
use std::sync::atomic::{
    AtomicBool,
    Ordering,
};
use std::sync::{
    Arc,
    Mutex,
};
use std::thread;
use std::time::{
    Duration,
    Instant,
};

use crossbeam_channel::unbounded;
use signal_hook::consts::SIGINT;

use cri_lib::{
    init_env_logger,
    CriSettings,
    ThreadControl,
    CRI_BANNER,
};
use cri_link::dma::DMA_DESC_ENTRY_SIZE;
use cri_link::link::apply_settings;
use cri_link::memory::{
    SimBar,
    UioBuffer,
};
use cri_link::monitoring::monitor_links;
use cri_link::prelude::*;
use cri_link::registers::MAX_LINKS;

#[macro_use] extern crate log;

extern crate clap;
use clap::{
    Parser,
    Subcommand,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Control the readout links of a CRI board", long_about = None)]
struct Args {
  /// BAR 0 of the board, e.g. /sys/bus/pci/devices/0000:01:00.0/resource0.
  /// Overrides the value from the config file
  #[arg(short, long)]
  bar: Option<String>,
  /// Don't touch any hardware, work on an in-memory register image
  #[arg(long, default_value_t = false)]
  simulate: bool,
  /// Settings file (.toml)
  #[arg(short, long)]
  config: Option<String>,
  /// The link to operate on
  #[arg(short, long, default_value_t = 0)]
  link: usize,
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show board and link information
  Info,
  /// Write and read back the test registers of the link
  Selftest,
  /// Set or clear the ready-for-data flag
  Readout {
    #[arg(value_parser = ["enable", "disable"])]
    state: String,
  },
  /// Select the data source (disable, user, pgen)
  Source {
    source: DataSource,
  },
  /// Configure the pattern generator
  Pgen {
    /// Equipment id
    #[arg(long)]
    id: Option<u16>,
    /// Rate as fraction of the maximum, [0,1]
    #[arg(long)]
    rate: Option<f32>,
  },
  /// Reset the pending microslice counter of the pattern generator
  ResetPgen,
  /// Show the performance counters
  Perf {
    /// Set the averaging interval first (ms, max 17000)
    #[arg(long)]
    interval_ms: Option<u32>,
    /// Print as json, one line per snapshot
    #[arg(long, default_value_t = false)]
    json: bool,
    /// Keep polling until Ctrl+C
    #[arg(long, default_value_t = false)]
    watch: bool,
  },
  /// Dump the raw packetizer counters
  Dump,
  /// Apply the link sections of the config file
  Configure,
  /// Disarm the DMA engine of the link, e.g. after the
  /// process owning it died. Nothing may use its buffers anymore.
  ResetDma,
  /// Run a DMA session which acknowledges all data without looking at it
  Dma {
    /// Data buffer device, e.g. /dev/udmabuf0
    #[arg(long, default_value = "/dev/udmabuf0")]
    data_dev: String,
    #[arg(long, default_value = "/sys/class/u-dma-buf/udmabuf0")]
    data_sysfs: String,
    /// Descriptor buffer device, e.g. /dev/udmabuf1
    #[arg(long, default_value = "/dev/udmabuf1")]
    desc_dev: String,
    #[arg(long, default_value = "/sys/class/u-dma-buf/udmabuf1")]
    desc_sysfs: String,
    /// Duration of the session in seconds
    #[arg(long, default_value_t = 10)]
    seconds: u64,
  },
}

fn fail(msg : String) -> ! {
  error!("{}", msg);
  process::exit(1);
}

fn print_perf(link : &CriLink, json : bool) {
  match link.link_perf() {
    Err(err) => error!("Unable to read perf counters! {}", err),
    Ok(perf) => {
      if json {
        match LinkPerfMetric::new(link.link_index(), perf).to_json() {
          Err(err) => error!("Unable to serialize perf snapshot! {err}"),
          Ok(line) => println!("{}", line),
        }
      } else {
        println!("link {} {}", link.link_index(), perf);
      }
    }
  }
}

fn watch_perf(link : &CriLink, json : bool, interval : Duration) {
  let term = Arc::new(AtomicBool::new(false));
  if let Err(err) = signal_hook::flag::register(SIGINT, Arc::clone(&term)) {
    fail(format!("Unable to install SIGINT handler! {err}"));
  }
  let thread_control = Arc::new(Mutex::new(ThreadControl::new()));
  let (tx, rx) = unbounded();
  let links = std::slice::from_ref(link);
  thread::scope(|s| {
    let tc = Arc::clone(&thread_control);
    s.spawn(move || monitor_links(links, &tx, interval, false, tc));
    while !term.load(Ordering::Relaxed) {
      match rx.recv_timeout(Duration::from_millis(200)) {
        Err(_)     => continue,
        Ok(metric) => {
          if json {
            match metric.to_json() {
              Err(err) => error!("Unable to serialize perf snapshot! {err}"),
              Ok(line) => println!("{}", line),
            }
          } else {
            println!("{} link {} {}", metric.timestamp, metric.link_index, metric.perf);
          }
        }
      }
    }
    info!("Received SIGINT, stopping monitoring");
    match thread_control.lock() {
      Ok(mut tc) => tc.stop_flag = true,
      Err(err)   => error!("Can't acquire lock! {err}"),
    }
  });
}

fn check_pattern(link : &mut CriLink, pattern : u32) -> Result<(u32, u32), CriError> {
  link.set_testreg_dma(pattern)?;
  link.set_testreg_data(!pattern)?;
  Ok((link.testreg_dma()?, link.testreg_data()?))
}

fn selftest(link : &mut CriLink) -> bool {
  let patterns = [0x0000_0000u32, 0xFFFF_FFFF, 0xAAAA_5555, 0x5555_AAAA, 0xDEAD_BEEF];
  let mut ok = true;
  for pattern in patterns {
    match check_pattern(link, pattern) {
      Err(err) => {
        error!("Bus access failed! {}", err);
        return false;
      }
      Ok((dma, data)) => {
        if dma != pattern || data != !pattern {
          error!("Pattern 0x{:08x}: read back pkt 0x{:08x}, gtx 0x{:08x}", pattern, dma, data);
          ok = false;
        }
      }
    }
  }
  ok
}

fn acknowledge_all(link : &mut CriLink, seconds : u64) -> Result<u64, CriError> {
  let start = Instant::now();
  let mut n_acks = 0u64;
  while start.elapsed() < Duration::from_secs(seconds) {
    let channel     = link.dma_mut()?;
    let data_offset = channel.data_offset()?;
    let desc_index  = channel.desc_index()?;
    let aligned     = data_offset - data_offset % channel.transfer_size() as u64;
    channel.set_sw_read_pointers(aligned, desc_index * DMA_DESC_ENTRY_SIZE)?;
    n_acks += 1;
    if n_acks % 1000 == 0 {
      info!("data offset 0x{:x}, desc index {}", data_offset, desc_index);
    }
    thread::sleep(Duration::from_millis(1));
  }
  Ok(n_acks)
}

/// Arm the engine, acknowledge whatever arrives, tear
/// down again. The caller drops the buffers only after
/// this returned.
fn dma_session(link    : &mut CriLink,
               data    : DmaBuffer,
               desc    : DmaBuffer,
               seconds : u64) -> Result<(), CriError> {
  link.init_dma(data, desc)?;
  let res = link.enable_readout()
    .and_then(|_| acknowledge_all(link, seconds));
  let disabled = link.disable_readout();
  link.deinit_dma();
  let n_acks = res?;
  disabled?;
  info!("DMA session finished after {} acknowledgements", n_acks);
  Ok(())
}

fn main() {
  init_env_logger();
  let args = Args::parse();

  let mut settings = match &args.config {
    None           => CriSettings::new(),
    Some(cfg_file) => {
      match CriSettings::from_toml(cfg_file) {
        Err(err) => fail(format!("Unable to parse .toml settings file {}! {}", cfg_file, err)),
        Ok(cfg)  => cfg
      }
    }
  };
  if let Some(bar) = &args.bar {
    settings.bar_path = bar.clone();
  }
  settings.simulate = settings.simulate || args.simulate;
  debug!("Using settings {}", settings);

  let device : CriDevice;
  let _sim   : Option<Arc<SimBar>>;
  if settings.simulate {
    warn!("Running on a simulated register image, no hardware is touched!");
    let (dev, sim) = CriDevice::simulated(MAX_LINKS);
    device = dev;
    _sim   = Some(sim);
  } else {
    device = match CriDevice::open(&settings.bar_path) {
      Err(err) => fail(format!("Unable to open board at {}! {}", settings.bar_path, err)),
      Ok(dev)  => dev
    };
    _sim = None;
  }

  let mut link = match device.link(args.link) {
    Err(err) => fail(format!("Unable to set up link {}! {}", args.link, err)),
    Ok(link) => link
  };

  let res : Result<(), CriError> = match args.command {
    Command::Info => {
      println!("{}", CRI_BANNER);
      println!("{}", device);
      println!("{}", link);
      Ok(())
    }
    Command::Selftest => {
      if selftest(&mut link) {
        println!("=> Selftest of link {} passed", link.link_index());
        Ok(())
      } else {
        fail(format!("Selftest of link {} failed!", link.link_index()))
      }
    }
    Command::Readout { state } => {
      if state == "enable" {
        link.enable_readout()
      } else {
        link.disable_readout()
      }
    }
    Command::Source { source } => {
      link.set_data_source(source)
    }
    Command::Pgen { id, rate } => {
      let mut res = Ok(());
      if let Some(eq_id) = id {
        res = res.and_then(|_| link.set_pgen_id(eq_id));
      }
      if let Some(r) = rate {
        res = res.and_then(|_| link.set_pgen_rate(r));
      }
      res
    }
    Command::ResetPgen => {
      link.reset_pgen_mc_pending()
    }
    Command::Perf { interval_ms, json, watch } => {
      let interval = interval_ms.unwrap_or(settings.perf_interval_ms);
      match link.set_perf_interval(interval) {
        Err(err) => Err(err),
        Ok(_)    => {
          if watch {
            watch_perf(&link, json, Duration::from_millis(settings.monitor_interval_ms));
          } else {
            print_perf(&link, json);
          }
          Ok(())
        }
      }
    }
    Command::Dump => {
      link.print_perf_raw().map(|dump| print!("{}", dump))
    }
    Command::Configure => {
      match settings.link(args.link) {
        None => fail(format!("No settings for link {} in the config file!", args.link)),
        Some(link_settings) => {
          info!("Applying {}", link_settings);
          apply_settings(&mut link, link_settings)
            .and_then(|_| link.set_perf_interval(settings.perf_interval_ms))
        }
      }
    }
    Command::ResetDma => {
      link.force_disarm_dma()
    }
    Command::Dma { data_dev, data_sysfs, desc_dev, desc_sysfs, seconds } => {
      if settings.simulate {
        dma_session(&mut link,
                    DmaBuffer::new(0x1_0000_0000, 24),
                    DmaBuffer::new(0x1_0100_0000, 16),
                    seconds)
      } else {
        let data_buf = match UioBuffer::open(&data_dev, &data_sysfs) {
          Err(err) => fail(format!("Unable to map data buffer {}! {}", data_dev, err)),
          Ok(buf)  => buf
        };
        let desc_buf = match UioBuffer::open(&desc_dev, &desc_sysfs) {
          Err(err) => fail(format!("Unable to map descriptor buffer {}! {}", desc_dev, err)),
          Ok(buf)  => buf
        };
        let res = dma_session(&mut link,
                              data_buf.as_dma_buffer(),
                              desc_buf.as_dma_buffer(),
                              seconds);
        // the engine is disarmed at this point, the buffers may go
        drop(data_buf);
        drop(desc_buf);
        res
      }
    }
  };
  if let Err(err) = res {
    fail(format!("Operation on link {} failed! {}", args.link, err));
  }
}
