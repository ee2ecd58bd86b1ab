use cri_lib::{
    CriSettings,
    LinkSettings,
    SettingsError,
};

fn test_file(name : &str) -> String {
  let mut path = std::env::temp_dir();
  path.push(format!("{}-{}.toml", name, std::process::id()));
  path.to_string_lossy().into_owned()
}

#[test]
fn write_and_read_config_file() {
  let mut settings = CriSettings::new();
  settings.simulate = true;
  let mut link = LinkSettings::new(1);
  link.data_source     = String::from("user");
  link.readout_enabled = true;
  settings.links.push(link);
  let filename = test_file("cri-config-test");
  settings.to_toml(filename.clone()).unwrap();
  let read_back = CriSettings::from_toml(&filename).unwrap();
  assert_eq!(read_back, settings);
  let _ = std::fs::remove_file(&filename);
}

#[test]
fn missing_config_file() {
  let res = CriSettings::from_toml("/this/path/does/not/exist.toml");
  assert_eq!(res, Err(SettingsError::FileNotReadable));
}

#[test]
fn garbage_config_file() {
  let filename = test_file("cri-config-garbage");
  std::fs::write(&filename, "bar_path = [[[").unwrap();
  let res = CriSettings::from_toml(&filename);
  assert_eq!(res, Err(SettingsError::TomlDecodingError));
  let _ = std::fs::remove_file(&filename);
}
