//! Stream descriptors for a command's stdin, stdout, and stderr, and the
//! adapter that turns them into OS stdio plus pump threads.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{ChildStderr, ChildStdin, ChildStdout, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use tokio::sync::{broadcast, mpsc};

use crate::error::{Error, Result};

const PUMP_BUFFER_SIZE: usize = 8 * 1024;

/// Where a command's stdin comes from. Unset means `/dev/null`.
#[derive(Clone)]
pub enum Input {
	Inherit,
	Null,
	Text(String),
	Bytes(Vec<u8>),
	File(PathBuf),
	/// Streamed in. A reader can feed only one launch.
	Reader(SharedReader),
	/// Byte chunks streamed in until the sender closes. Feeds only one launch.
	Chunks(SharedChunks),
	/// Text chunks, written as UTF-8, until the sender closes. Feeds only one
	/// launch.
	TextChunks(SharedTextChunks),
}

/// Where a command's stdout or stderr goes. Unset means `/dev/null`.
#[derive(Clone)]
pub enum Output {
	Inherit,
	Null,
	/// Appended to, created if missing.
	File(PathBuf),
	Capture(Capture),
	Writer(SharedWriter),
	/// Raw chunks as the command writes them.
	Chunks(mpsc::Sender<Vec<u8>>),
	/// One message per line, newline stripped, lossily decoded.
	Lines(mpsc::Sender<String>),
}

pub type SharedReader = Arc<Mutex<Option<Box<dyn Read + Send>>>>;
pub type SharedChunks = Arc<Mutex<Option<mpsc::Receiver<Vec<u8>>>>>;
pub type SharedTextChunks = Arc<Mutex<Option<mpsc::Receiver<String>>>>;
pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

impl Input {
	pub fn reader(reader: impl Read + Send + 'static) -> Self {
		Input::Reader(Arc::new(Mutex::new(Some(Box::new(reader)))))
	}

	pub fn chunks(rx: mpsc::Receiver<Vec<u8>>) -> Self {
		Input::Chunks(Arc::new(Mutex::new(Some(rx))))
	}

	pub fn text_chunks(rx: mpsc::Receiver<String>) -> Self {
		Input::TextChunks(Arc::new(Mutex::new(Some(rx))))
	}

	/// Resolves a config value: `"inherit"`, `"null"`, `{ text = "..." }`, or
	/// `{ file = "..." }`.
	pub fn from_value(value: &toml::Value) -> Result<Self> {
		match value {
			toml::Value::String(s) if s == "inherit" => Ok(Input::Inherit),
			toml::Value::String(s) if s == "null" => Ok(Input::Null),
			toml::Value::Table(t) if t.len() == 1 => match t.iter().next() {
				Some((key, toml::Value::String(s))) if key == "text" => Ok(Input::Text(s.clone())),
				Some((key, toml::Value::String(s))) if key == "file" => Ok(Input::File(s.into())),
				_ => Err(unadaptable(value)),
			},
			_ => Err(unadaptable(value)),
		}
	}

	fn shape(&self) -> &'static str {
		match self {
			Input::Inherit => "inherit",
			Input::Null => "null",
			Input::Text(_) => "text",
			Input::Bytes(_) => "bytes",
			Input::File(_) => "file",
			Input::Reader(_) => "reader",
			Input::Chunks(_) => "chunks",
			Input::TextChunks(_) => "text chunks",
		}
	}
}

impl Output {
	pub fn writer(writer: impl Write + Send + 'static) -> Self {
		Output::Writer(Arc::new(Mutex::new(Box::new(writer))))
	}

	/// Resolves a config value: `"inherit"`, `"null"`, `"capture"`, or
	/// `{ file = "..." }`.
	pub fn from_value(value: &toml::Value) -> Result<Self> {
		match value {
			toml::Value::String(s) if s == "inherit" => Ok(Output::Inherit),
			toml::Value::String(s) if s == "null" => Ok(Output::Null),
			toml::Value::String(s) if s == "capture" => Ok(Output::Capture(Capture::new())),
			toml::Value::Table(t) if t.len() == 1 => match t.get("file") {
				Some(toml::Value::String(s)) => Ok(Output::File(s.into())),
				_ => Err(unadaptable(value)),
			},
			_ => Err(unadaptable(value)),
		}
	}

	pub fn as_capture(&self) -> Option<&Capture> {
		match self {
			Output::Capture(c) => Some(c),
			_ => None,
		}
	}

	fn shape(&self) -> &'static str {
		match self {
			Output::Inherit => "inherit",
			Output::Null => "null",
			Output::File(_) => "file",
			Output::Capture(_) => "capture",
			Output::Writer(_) => "writer",
			Output::Chunks(_) => "chunks",
			Output::Lines(_) => "lines",
		}
	}
}

impl From<&str> for Input {
	fn from(text: &str) -> Self {
		Input::Text(text.to_string())
	}
}

impl From<String> for Input {
	fn from(text: String) -> Self {
		Input::Text(text)
	}
}

impl From<Vec<u8>> for Input {
	fn from(bytes: Vec<u8>) -> Self {
		Input::Bytes(bytes)
	}
}

impl From<Capture> for Output {
	fn from(capture: Capture) -> Self {
		Output::Capture(capture)
	}
}

impl fmt::Debug for Input {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Input::Text(s) => f.debug_tuple("Text").field(s).finish(),
			Input::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
			Input::File(p) => f.debug_tuple("File").field(p).finish(),
			other => f.write_str(other.shape()),
		}
	}
}

impl fmt::Debug for Output {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Output::File(p) => f.debug_tuple("File").field(p).finish(),
			other => f.write_str(other.shape()),
		}
	}
}

fn unadaptable(value: &toml::Value) -> Error {
	Error::UnadaptableStream {
		shape: crate::bake::describe(value),
	}
}

/// In-memory sink for command output.
///
/// Clones share one buffer, so handing the same capture to stdout and stderr
/// collects combined output. Every chunk is also broadcast to subscribers.
#[derive(Clone)]
pub struct Capture {
	buf: Arc<Mutex<Vec<u8>>>,
	sender: broadcast::Sender<Vec<u8>>,
}

impl Capture {
	pub fn new() -> Self {
		let (sender, _) = broadcast::channel(256);
		Self {
			buf: Arc::new(Mutex::new(Vec::new())),
			sender,
		}
	}

	pub fn write(&self, data: &[u8]) {
		self.buf
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.extend_from_slice(data);
		let _ = self.sender.send(data.to_vec());
	}

	pub fn snapshot(&self) -> Vec<u8> {
		self.buf.lock().unwrap_or_else(PoisonError::into_inner).clone()
	}

	pub fn text(&self) -> String {
		String::from_utf8_lossy(&self.snapshot()).into_owned()
	}

	pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
		self.sender.subscribe()
	}

	fn same_buffer(&self, other: &Capture) -> bool {
		Arc::ptr_eq(&self.buf, &other.buf)
	}
}

impl Default for Capture {
	fn default() -> Self {
		Self::new()
	}
}

/// Stdio resolved for one launch, plus what still has to be attached once the
/// child's pipes exist.
pub(crate) struct Wiring {
	pub stdin: Stdio,
	pub stdout: Stdio,
	pub stderr: Stdio,
	feed: Option<Feed>,
	out: Option<Output>,
	err: Option<Output>,
}

enum Feed {
	Bytes(Vec<u8>),
	Reader(Box<dyn Read + Send>),
	Chunks(mpsc::Receiver<Vec<u8>>),
	TextChunks(mpsc::Receiver<String>),
}

/// Running pump threads for one child.
pub(crate) struct Pumps {
	outputs: Vec<JoinHandle<()>>,
}

impl Pumps {
	/// Waits for stdout/stderr to drain. Stdin feeders are left detached: one
	/// blocked on a channel that never closes shouldn't hold up completion.
	pub fn join(self) {
		for handle in self.outputs {
			let _ = handle.join();
		}
	}
}

impl Wiring {
	pub fn resolve(
		stdin: Option<&Input>,
		stdout: Option<&Output>,
		stderr: Option<&Output>,
	) -> Result<Self> {
		let (stdin, feed) = resolve_input(stdin)?;
		let (stdout, out) = resolve_output(stdout)?;
		let (stderr, err) = resolve_output(stderr)?;
		Ok(Self {
			stdin,
			stdout,
			stderr,
			feed,
			out,
			err,
		})
	}

	pub fn take_stdio(&mut self) -> (Stdio, Stdio, Stdio) {
		(
			std::mem::replace(&mut self.stdin, Stdio::null()),
			std::mem::replace(&mut self.stdout, Stdio::null()),
			std::mem::replace(&mut self.stderr, Stdio::null()),
		)
	}

	/// Starts pump threads for whichever streams were piped.
	pub fn attach(
		self,
		stdin: Option<ChildStdin>,
		stdout: Option<ChildStdout>,
		stderr: Option<ChildStderr>,
	) -> Pumps {
		if let (Some(feed), Some(pipe)) = (self.feed, stdin) {
			std::thread::spawn(move || feed_stdin(feed, pipe));
		}
		let mut outputs = Vec::new();
		if let (Some(sink), Some(pipe)) = (self.out, stdout) {
			outputs.push(std::thread::spawn(move || pump_output(pipe, sink)));
		}
		if let (Some(sink), Some(pipe)) = (self.err, stderr) {
			outputs.push(std::thread::spawn(move || pump_output(pipe, sink)));
		}
		Pumps { outputs }
	}
}

fn resolve_input(input: Option<&Input>) -> Result<(Stdio, Option<Feed>)> {
	let feed = match input {
		None | Some(Input::Null) => return Ok((Stdio::null(), None)),
		Some(Input::Inherit) => return Ok((Stdio::inherit(), None)),
		Some(Input::File(path)) => {
			let file = File::open(path).map_err(|source| Error::StreamOpen {
				path: path.clone(),
				source,
			})?;
			return Ok((Stdio::from(file), None));
		}
		Some(Input::Text(s)) => Feed::Bytes(s.clone().into_bytes()),
		Some(Input::Bytes(b)) => Feed::Bytes(b.clone()),
		Some(Input::Reader(shared)) => Feed::Reader(
			shared
				.lock()
				.unwrap_or_else(PoisonError::into_inner)
				.take()
				.ok_or_else(consumed("reader"))?,
		),
		Some(Input::Chunks(shared)) => Feed::Chunks(
			shared
				.lock()
				.unwrap_or_else(PoisonError::into_inner)
				.take()
				.ok_or_else(consumed("chunk channel"))?,
		),
		Some(Input::TextChunks(shared)) => Feed::TextChunks(
			shared
				.lock()
				.unwrap_or_else(PoisonError::into_inner)
				.take()
				.ok_or_else(consumed("text chunk channel"))?,
		),
	};
	Ok((Stdio::piped(), Some(feed)))
}

fn consumed(what: &'static str) -> impl FnOnce() -> Error {
	move || Error::UnadaptableStream {
		shape: format!("{} already consumed by an earlier launch", what),
	}
}

fn resolve_output(output: Option<&Output>) -> Result<(Stdio, Option<Output>)> {
	match output {
		None | Some(Output::Null) => Ok((Stdio::null(), None)),
		Some(Output::Inherit) => Ok((Stdio::inherit(), None)),
		Some(Output::File(path)) => {
			let file = OpenOptions::new()
				.create(true)
				.append(true)
				.open(path)
				.map_err(|source| Error::StreamOpen {
					path: path.clone(),
					source,
				})?;
			Ok((Stdio::from(file), None))
		}
		Some(sink) => Ok((Stdio::piped(), Some(sink.clone()))),
	}
}

/// True when stdout and stderr land in the same capture.
pub(crate) fn shares_capture(stdout: Option<&Output>, stderr: Option<&Output>) -> bool {
	match (stdout.and_then(Output::as_capture), stderr.and_then(Output::as_capture)) {
		(Some(a), Some(b)) => a.same_buffer(b),
		_ => false,
	}
}

fn feed_stdin(feed: Feed, mut pipe: ChildStdin) {
	// Broken pipes just mean the child stopped reading.
	let _ = match feed {
		Feed::Bytes(bytes) => pipe.write_all(&bytes),
		Feed::Reader(mut reader) => io::copy(&mut reader, &mut pipe).map(|_| ()),
		Feed::Chunks(mut rx) => {
			let mut result = Ok(());
			while let Some(chunk) = rx.blocking_recv() {
				if let Err(e) = pipe.write_all(&chunk) {
					result = Err(e);
					break;
				}
			}
			result
		}
		Feed::TextChunks(mut rx) => {
			let mut result = Ok(());
			while let Some(chunk) = rx.blocking_recv() {
				if let Err(e) = pipe.write_all(chunk.as_bytes()) {
					result = Err(e);
					break;
				}
			}
			result
		}
	};
}

/// Copies one child pipe into `sink`. If the sink goes away, the rest of the
/// pipe is drained and discarded so the child never blocks on a full pipe.
fn pump_output<R: Read>(reader: R, sink: Output) {
	let mut reader = BufReader::with_capacity(PUMP_BUFFER_SIZE, reader);

	if let Output::Lines(tx) = &sink {
		let mut line = Vec::new();
		loop {
			line.clear();
			match reader.read_until(b'\n', &mut line) {
				Ok(0) | Err(_) => return,
				Ok(_) => {}
			}
			if line.last() == Some(&b'\n') {
				line.pop();
			}
			if line.last() == Some(&b'\r') {
				line.pop();
			}
			if tx.blocking_send(String::from_utf8_lossy(&line).into_owned()).is_err() {
				break;
			}
		}
		let _ = io::copy(&mut reader, &mut io::sink());
		return;
	}

	loop {
		let chunk = match reader.fill_buf() {
			Ok([]) => return,
			Ok(chunk) => chunk.to_vec(),
			Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
			Err(_) => return,
		};
		reader.consume(chunk.len());
		let delivered = match &sink {
			Output::Capture(capture) => {
				capture.write(&chunk);
				true
			}
			Output::Writer(writer) => {
				let mut w = writer.lock().unwrap_or_else(PoisonError::into_inner);
				w.write_all(&chunk).and_then(|_| w.flush()).is_ok()
			}
			Output::Chunks(tx) => tx.blocking_send(chunk).is_ok(),
			_ => false,
		};
		if !delivered {
			break;
		}
	}
	let _ = io::copy(&mut reader, &mut io::sink());
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn capture_clones_share_buffer() {
		let a = Capture::new();
		let b = a.clone();
		a.write(b"out ");
		b.write(b"err");
		assert_eq!(a.text(), "out err");
		assert!(shares_capture(
			Some(&Output::Capture(a.clone())),
			Some(&Output::Capture(b))
		));
		assert!(!shares_capture(
			Some(&Output::Capture(a)),
			Some(&Output::Capture(Capture::new()))
		));
	}

	#[test]
	fn capture_broadcasts_chunks() {
		let capture = Capture::new();
		let mut rx = capture.subscribe();
		capture.write(b"hello");
		assert_eq!(rx.try_recv().unwrap(), b"hello".to_vec());
	}

	#[test]
	fn input_from_config_values() {
		let v: toml::Value = toml::from_str("a = 'inherit'\nb = { text = 'hi' }\nc = 3").unwrap();
		assert!(matches!(Input::from_value(&v["a"]), Ok(Input::Inherit)));
		assert!(matches!(Input::from_value(&v["b"]), Ok(Input::Text(ref s)) if s == "hi"));
		match Input::from_value(&v["c"]) {
			Err(Error::UnadaptableStream { shape }) => assert_eq!(shape, "integer"),
			other => panic!("unexpected {:?}", other.map(|_| ())),
		}
	}

	#[test]
	fn output_from_config_values() {
		let v: toml::Value =
			toml::from_str("a = 'capture'\nb = { file = '/tmp/x.log' }\nc = 'loud'").unwrap();
		assert!(matches!(Output::from_value(&v["a"]), Ok(Output::Capture(_))));
		assert!(matches!(Output::from_value(&v["b"]), Ok(Output::File(_))));
		assert!(matches!(
			Output::from_value(&v["c"]),
			Err(Error::UnadaptableStream { .. })
		));
	}

	#[test]
	fn text_chunks_feed_one_launch() {
		let (_tx, rx) = mpsc::channel::<String>(1);
		let input = Input::text_chunks(rx);
		assert_eq!(format!("{:?}", input), "text chunks");
		assert!(matches!(resolve_input(Some(&input)), Ok((_, Some(Feed::TextChunks(_))))));
		match resolve_input(Some(&input)) {
			Err(Error::UnadaptableStream { shape }) => assert!(shape.starts_with("text chunk channel")),
			other => panic!("unexpected {:?}", other.map(|_| ())),
		}
	}

	#[test]
	fn reader_feeds_one_launch() {
		let input = Input::reader(std::io::Cursor::new(b"once".to_vec()));
		assert!(resolve_input(Some(&input)).is_ok());
		assert!(matches!(
			resolve_input(Some(&input)),
			Err(Error::UnadaptableStream { .. })
		));
	}
}
