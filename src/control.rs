// HOTPLUGD CONTROL SOCKET
// LINE PROTOCOL OVER A UNIX SOCKET, ONE REQUEST PER LINE:
//   get KEY | set KEY VALUE | keys | status | suspend | resume
// REPLIES: "ok", "ok <value>", "err <message>"

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{HotplugError, Result};
use crate::governor::{Event, Governor};
use crate::platform::Platform;

const ACCEPT_POLL: Duration = Duration::from_millis(100);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn respond<P: Platform + 'static>(governor: &Governor<P>, line: &str) -> String {
    let mut words = line.split_whitespace();
    let cmd = words.next().unwrap_or("");
    let args: Vec<&str> = words.collect();

    let reply = match (cmd, args.as_slice()) {
        ("get", [key]) => governor.read_knob(key).map(Some),
        ("set", [key, value]) => governor.write_knob(key, value).map(|_| None),
        ("keys", []) => Ok(Some(governor.keys().join(" "))),
        ("status", []) => Ok(Some(governor.status().to_string())),
        ("suspend", []) => {
            governor.handle(Event::Suspending);
            Ok(None)
        }
        ("resume", []) => {
            governor.handle(Event::Resumed);
            Ok(None)
        }
        ("", _) => return "err empty request".to_string(),
        _ => return format!("err unknown command: {}", line.trim()),
    };

    match reply {
        Ok(Some(v)) => format!("ok {}", v),
        Ok(None) => "ok".to_string(),
        Err(e) => format!("err {}", e),
    }
}

pub struct ControlServer {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ControlServer {
    pub fn spawn<P: Platform + 'static>(path: &Path, governor: Arc<Governor<P>>) -> Result<Self> {
        let sock_err = |source| HotplugError::Socket { path: path.to_path_buf(), source };

        // STALE SOCKET FROM A PREVIOUS RUN
        if path.exists() {
            std::fs::remove_file(path).map_err(sock_err)?;
        }
        let listener = UnixListener::bind(path).map_err(sock_err)?;
        listener.set_nonblocking(true).map_err(sock_err)?;

        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::Builder::new()
            .name("hotplugd-control".into())
            .spawn(move || accept_loop(&listener, &governor, &flag))
            .map_err(|e| HotplugError::Spawn("control socket", e))?;

        info!(path = %path.display(), "control socket listening");
        Ok(Self { path: path.to_path_buf(), stop, handle: Some(handle) })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop<P: Platform + 'static>(listener: &UnixListener, governor: &Governor<P>, stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = serve(stream, governor) {
                    debug!(error = %e, "control client dropped");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => std::thread::sleep(ACCEPT_POLL),
            Err(e) => {
                warn!(error = %e, "control accept failed");
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn serve<P: Platform + 'static>(stream: UnixStream, governor: &Governor<P>) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
    let mut writer = stream.try_clone()?;
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = respond(governor, &line);
        debug!(request = line.trim(), reply = %reply, "control");
        writeln!(writer, "{}", reply)?;
    }
    Ok(())
}

// CLIENT SIDE: ONE REQUEST, ONE REPLY LINE
pub fn request(path: &Path, line: &str) -> std::io::Result<String> {
    let mut stream = UnixStream::connect(path)?;
    stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
    writeln!(stream, "{}", line.trim())?;
    stream.shutdown(std::net::Shutdown::Write)?;
    let mut reply = String::new();
    BufReader::new(stream).read_line(&mut reply)?;
    Ok(reply.trim_end().to_string())
}
