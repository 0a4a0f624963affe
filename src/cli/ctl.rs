use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use hotplugd::config::DEFAULT_SOCKET_PATH;
use hotplugd::control::request;

pub fn run_ctl(socket: Option<PathBuf>, words: &[String]) -> Result<()> {
    let path = socket.unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));
    let line = words.join(" ");
    let reply = request(&path, &line)
        .with_context(|| format!("no governor listening on {}", path.display()))?;

    if let Some(err) = reply.strip_prefix("err ") {
        bail!("{}", err);
    }
    match reply.strip_prefix("ok") {
        Some(rest) => {
            let rest = rest.trim();
            if words.first().map(String::as_str) == Some("keys") {
                for key in rest.split_whitespace() {
                    println!("{}", key);
                }
            } else if !rest.is_empty() {
                println!("{}", rest);
            }
            Ok(())
        }
        None => bail!("malformed reply: {:?}", reply),
    }
}
