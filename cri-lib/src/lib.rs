//! Shared plumbing for the CRI readout-link tools
//!
//! * settings      - the .toml configuration for the link tools
//! * thread_control - stop/alive flags shared with polling threads
//! * logging setup in the common format
//!
pub mod settings;
pub mod thread_control;

pub use settings::{
    CriSettings,
    LinkSettings,
    SettingsError,
};
pub use thread_control::ThreadControl;

use std::io::Write;

use colored::{Colorize, ColoredString};
use log::Level;

#[macro_use] extern crate log;
extern crate env_logger;

pub const CRI_BANNER : &str = "
   ___ ___ ___      _ _      _
  / __| _ \\_ _|___ | (_)_ _ | |__
 | (__|   /| ||___|| | | ' \\| / /
  \\___|_|_\\___|    |_|_|_||_|_\\_\\

  (cri-link - readout link control for the CRI PCIe board)
  ";

/// Make sure that the loglevel is in color, even though not using pretty_env logger
pub fn color_log(level : &Level) -> ColoredString {
  match level {
    Level::Error    => String::from(" ERROR!").red(),
    Level::Warn     => String::from(" WARN  ").yellow(),
    Level::Info     => String::from(" Info  ").green(),
    Level::Debug    => String::from(" debug ").blue(),
    Level::Trace    => String::from(" trace ").cyan(),
  }
}

/// Set up the environmental (env) logger
/// with our format
///
/// Ensure that the lines and module paths
/// are printed in the logging output
pub fn init_env_logger() {
  env_logger::builder()
    .format(|buf, record| {
    writeln!( buf, "[{level}][{module_path}:{line}] {args}",
      level = color_log(&record.level()),
      module_path = record.module_path().unwrap_or("<unknown>"),
      line = record.line().unwrap_or(0),
      args = record.args()
      )
    }).init();
}
