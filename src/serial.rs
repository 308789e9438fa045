//! Background consumer of the guest's serial console.

use std::io::{BufRead, BufReader, Read};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use log::debug;

use crate::logger::TestLogger;

/// Spawn the serial reader for one machine.
///
/// The thread reads the guest subprocess's stdout line by line, decodes
/// lossily, strips carriage returns and trailing whitespace, then pushes
/// each line into `lines` and mirrors it to the serial log sink. It exits
/// when stdout yields EOF, which happens when the emulator terminates.
///
/// Exactly one of these runs per machine while it is booted.
pub(crate) fn spawn<R>(
    stdout: R,
    lines: Sender<String>,
    log_serial: Arc<dyn TestLogger>,
    name: String,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    let mut reader = BufReader::new(stdout);

    thread::spawn(move || loop {
        let mut raw = Vec::new();
        match reader.read_until(b'\n', &mut raw) {
            Ok(0) => break,
            Ok(_) => {
                // Boot menus interleave escape sequences and undecodable
                // bytes; keep what decodes.
                let line = String::from_utf8_lossy(&raw).replace('\r', "");
                let line = line.trim_end().to_string();
                log_serial.log(&format!("[{name} console] {line}"));
                let _ = lines.send(line);
            }
            Err(e) => {
                debug!("Failed to read from serial console: {e}");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;
    use std::sync::mpsc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl TestLogger for Recorder {
        fn log(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    #[test]
    fn test_lines_are_cleaned_and_ordered() {
        let console = Cursor::new(b"alpha\r\nbeta  \ngamma".to_vec());
        let (tx, rx) = mpsc::channel();
        let recorder = Arc::new(Recorder::default());

        let reader = spawn(console, tx, recorder.clone(), "node".to_string());
        reader.join().unwrap();

        let lines: Vec<String> = rx.iter().collect();
        assert_eq!(lines, vec!["alpha", "beta", "gamma"]);
        assert_eq!(
            recorder.0.lock().unwrap().clone(),
            vec![
                "[node console] alpha",
                "[node console] beta",
                "[node console] gamma"
            ]
        );
    }

    #[test]
    fn test_undecodable_bytes_do_not_stop_the_reader() {
        let console = Cursor::new(b"ok\n\xff\xfe menu\nlast\n".to_vec());
        let (tx, rx) = mpsc::channel();

        let reader = spawn(
            console,
            tx,
            Arc::new(Recorder::default()),
            "node".to_string(),
        );
        reader.join().unwrap();

        let lines: Vec<String> = rx.iter().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "ok");
        assert_eq!(lines[2], "last");
        assert!(lines[1].ends_with("menu"));
    }

    #[test]
    fn test_reader_exits_when_consumer_is_gone() {
        let console = Cursor::new(b"one\ntwo\n".to_vec());
        let (tx, rx) = mpsc::channel();
        drop(rx);

        // The reader keeps draining so the guest never blocks on a full
        // pipe, then exits at EOF.
        let reader = spawn(
            console,
            tx,
            Arc::new(Recorder::default()),
            "node".to_string(),
        );
        reader.join().unwrap();
    }
}
