//! Settings for the CRI link tools
//!
//! Which BAR to map, the perf averaging interval and the
//! per-link configuration (data source, pattern generator,
//! flow control) which `cri-ctl configure` applies.
//!

use std::fs::File;
use std::io::{
    Write,
    Read,
};
use std::error::Error;
use std::fmt;

extern crate toml;

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum SettingsError {
  FileNotReadable,
  FileNotWritable,
  TomlDecodingError,
  TomlEncodingError,
}

impl fmt::Display for SettingsError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let etype = match self {
      SettingsError::FileNotReadable   => "FileNotReadable",
      SettingsError::FileNotWritable   => "FileNotWritable",
      SettingsError::TomlDecodingError => "TomlDecodingError",
      SettingsError::TomlEncodingError => "TomlEncodingError",
    };
    write!(f, "<SettingsError: {}>", etype)
  }
}

impl Error for SettingsError {
}

/// Configuration of a single readout link
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LinkSettings {
  /// The link this section applies to
  pub link_index      : usize,
  /// One of "disable", "user", "pgen"
  pub data_source     : String,
  /// Equipment id the pattern generator
  /// stamps into its microslices
  pub pgen_id         : u16,
  /// Fraction of the maximum pattern
  /// generator rate, [0,1]
  pub pgen_rate       : f32,
  /// Set the ready-for-data flag after
  /// configuring the link
  pub readout_enabled : bool,
}

impl LinkSettings {
  pub fn new(link_index : usize) -> Self {
    Self {
      link_index      : link_index,
      data_source     : String::from("disable"),
      pgen_id         : 0,
      pgen_rate       : 1.0,
      readout_enabled : false,
    }
  }
}

impl fmt::Display for LinkSettings {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let disp : String;
    match toml::to_string(self) {
      Err(err) => {
        error!("Deserialization error! {err}");
        disp = String::from("-- DESERIALIZATION ERROR! --");
      }
      Ok(_disp) => {
        disp = _disp;
      }
    }
    write!(f, "<LinkSettings :\n{}>", disp)
  }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CriSettings {
  /// Path to the BAR of the board, e.g.
  /// /sys/bus/pci/devices/0000:01:00.0/resource0
  pub bar_path            : String,
  /// Do not touch the hardware, use an
  /// in-memory register image instead
  pub simulate            : bool,
  /// Averaging interval for the hardware
  /// performance counters in ms (max 17000)
  pub perf_interval_ms    : u32,
  /// Interval with which the monitoring
  /// thread polls the counters in ms
  pub monitor_interval_ms : u64,
  pub links               : Vec<LinkSettings>,
}

impl CriSettings {
  pub fn new() -> Self {
    Self {
      bar_path            : String::from("/sys/bus/pci/devices/0000:01:00.0/resource0"),
      simulate            : false,
      perf_interval_ms    : 1000,
      monitor_interval_ms : 1000,
      links               : vec![LinkSettings::new(0)],
    }
  }

  /// Write the settings to a toml file
  pub fn to_toml(&self, mut filename : String) -> Result<(), SettingsError> {
    if !filename.ends_with(".toml") {
      filename += ".toml";
    }
    info!("Will write to file {}!", filename);
    let toml_string = match toml::to_string_pretty(&self) {
      Err(err) => {
        error!("Unable to serialize toml! {err}");
        return Err(SettingsError::TomlEncodingError);
      }
      Ok(toml_string) => toml_string
    };
    let mut file = match File::create(&filename) {
      Err(err) => {
        error!("Unable to open file {}! {}", filename, err);
        return Err(SettingsError::FileNotWritable);
      }
      Ok(file) => file
    };
    match file.write_all(toml_string.as_bytes()) {
      Err(err) => {
        error!("Unable to write to file {}! {}", filename, err);
        Err(SettingsError::FileNotWritable)
      }
      Ok(_)    => {
        debug!("Wrote settings to {}!", filename);
        Ok(())
      }
    }
  }

  /// Load settings from a toml file
  pub fn from_toml(filename : &str) -> Result<CriSettings, SettingsError> {
    let mut file = match File::open(filename) {
      Err(err) => {
        error!("Unable to open {}! {}", filename, err);
        return Err(SettingsError::FileNotReadable);
      }
      Ok(file) => file
    };
    let mut toml_string = String::from("");
    if let Err(err) = file.read_to_string(&mut toml_string) {
      error!("Unable to read {}! {}", filename, err);
      return Err(SettingsError::FileNotReadable);
    }
    match toml::from_str(&toml_string) {
      Err(err) => {
        error!("Can't interpret toml! {}", err);
        Err(SettingsError::TomlDecodingError)
      }
      Ok(settings) => Ok(settings)
    }
  }

  /// The settings section for a specific link, if any
  pub fn link(&self, link_index : usize) -> Option<&LinkSettings> {
    self.links.iter().find(|l| l.link_index == link_index)
  }
}

impl Default for CriSettings {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for CriSettings {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let disp : String;
    match toml::to_string(self) {
      Err(err) => {
        error!("Deserialization error! {err}");
        disp = String::from("-- DESERIALIZATION ERROR! --");
      }
      Ok(_disp) => {
        disp = _disp;
      }
    }
    write!(f, "<CriSettings :\n{}>", disp)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_settings_have_link_zero() {
    let settings = CriSettings::default();
    assert_eq!(settings.perf_interval_ms, 1000);
    assert!(settings.link(0).is_some());
    assert!(settings.link(1).is_none());
  }

  #[test]
  fn toml_string_roundtrip() {
    let mut settings = CriSettings::new();
    let mut link     = LinkSettings::new(3);
    link.data_source = String::from("pgen");
    link.pgen_rate   = 0.25;
    settings.links.push(link.clone());
    let as_str = toml::to_string_pretty(&settings).unwrap();
    let back : CriSettings = toml::from_str(&as_str).unwrap();
    assert_eq!(back, settings);
    assert_eq!(back.link(3), Some(&link));
  }
}
