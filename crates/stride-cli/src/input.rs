//! Parsing of the lines typed into `stride chat`.

use std::path::{Path, PathBuf};

#[derive(Debug, PartialEq, Eq)]
pub enum Input {
  Text(String),
  Older,
  Attach { path: PathBuf, content_type: String },
  Quit,
  Help,
  Empty,
}

pub const HELP: &str = "\
  <text>               send a message
  /older               load older messages
  /attach PATH [MIME]  send a file
  /quit                leave the conversation";

pub fn parse(line: &str) -> Result<Input, String> {
  let line = line.trim();
  let Some(command) = line.strip_prefix('/') else {
    return Ok(if line.is_empty() { Input::Empty } else { Input::Text(line.to_owned()) });
  };

  let mut words = command.split_whitespace();
  match words.next() {
    Some("quit" | "q") => Ok(Input::Quit),
    Some("older") => Ok(Input::Older),
    Some("help" | "?") => Ok(Input::Help),
    Some("attach") => {
      let path = PathBuf::from(words.next().ok_or("usage: /attach PATH [MIME]")?);
      let content_type = match words.next() {
        Some(mime) => mime.to_owned(),
        None => guess_content_type(&path).to_owned(),
      };
      Ok(Input::Attach { path, content_type })
    }
    Some(other) => Err(format!("unknown command /{other}; try /help")),
    None => Err("empty command; try /help".to_owned()),
  }
}

pub fn guess_content_type(path: &Path) -> &'static str {
  let ext = path
    .extension()
    .and_then(|e| e.to_str())
    .map(str::to_ascii_lowercase);
  match ext.as_deref() {
    Some("png") => "image/png",
    Some("jpg" | "jpeg") => "image/jpeg",
    Some("gif") => "image/gif",
    Some("webp") => "image/webp",
    Some("heic") => "image/heic",
    Some("pdf") => "application/pdf",
    Some("txt") => "text/plain",
    _ => "application/octet-stream",
  }
}
