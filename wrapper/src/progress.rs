//! Line-oriented extraction of per-disk progress from the conversion
//! binary's output.
//!
//! The backend's output is unstructured text, so recognition is kept to
//! a small explicit grammar of line shapes; everything unrecognized is
//! passed through to the conversion log untouched and never fails the
//! job. The grammar is versioned through its constructor so a future
//! backend with a different format gets its own set of patterns rather
//! than edits scattered through the parser.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

/// Which pipe a chunk of output arrived on. Both feed the same parser;
/// the split only matters for partial-line buffering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// A state-relevant fact extracted from one output line.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// `Copying disk <index>/<total> to ...` banner. Carries the
    /// backend's claimed disk total; `index` is 1-based.
    CopyDisk { index: usize, total: usize },
    /// The backend named the path it is about to copy.
    DiskPath { path: String },
    /// A progress tick for the currently copied path.
    Progress { path: String, percent: f64 },
    /// A fatal error marker; the run is unsuccessful even on a zero
    /// exit code.
    FatalError { message: String },
}

/// One completed line: the raw text for the conversion log, plus
/// whatever the grammar recognized in it.
#[derive(Debug)]
pub struct ParsedLine {
    pub raw: String,
    pub update: Option<Update>,
}

/// Recognized line shapes of one backend output format.
pub struct Grammar {
    copy_disk: Regex,
    disk_progress: Regex,
    nbdkit_disk_path: Regex,
    overlay_source: Regex,
    overlay_backing: Regex,
    vmdk_path: Regex,
    fatal_error: Regex,
}

impl Grammar {
    /// The virt-v2v output format (verbose mode plus nbdkit debug and
    /// libguestfs trace lines).
    pub fn virt_v2v() -> &'static Grammar {
        static GRAMMAR: Lazy<Grammar> = Lazy::new(|| Grammar {
            copy_disk: Regex::new(r"^.*Copying disk (\d+)/(\d+) to").unwrap(),
            disk_progress: Regex::new(r"^\s+\((\d+\.\d+)/100%\)").unwrap(),
            nbdkit_disk_path: Regex::new(r"^nbdkit: debug: Opening file (.*) \(.*\)").unwrap(),
            overlay_source: Regex::new(
                r#"^ *overlay source qemu URI: json:.*"file\.path": ?"([^"]+)""#,
            )
            .unwrap(),
            overlay_backing: Regex::new(
                r#"^libguestfs: parse_json: qemu-img info JSON output:.*"backing-filename".*\\"file\.path\\": ?\\"([^"]+)\\""#,
            )
            .unwrap(),
            vmdk_path: Regex::new(
                r"/vmfs/volumes/(?P<store>[^/]*)/(?P<vm>[^/]*)/(?P<disk>.*?)(?:-flat)?\.vmdk$",
            )
            .unwrap(),
            fatal_error: Regex::new(r"^virt-v2v: error:\s*(.*)").unwrap(),
        });
        &GRAMMAR
    }

    /// Rewrite an absolute ESXi path into the `[datastore] vm/disk.vmdk`
    /// form the request and the rest of the system use.
    fn datastore_path(&self, path: &str) -> String {
        self.vmdk_path
            .replace(path, "[${store}] ${vm}/${disk}.vmdk")
            .into_owned()
    }
}

/// Machine-readable messages the backend can interleave with its text
/// output.
#[derive(Deserialize)]
struct MachineMessage {
    #[serde(rename = "type")]
    kind: String,
    message: Option<String>,
}

/// Forward-only parser over both output streams of the subprocess.
///
/// Chunks may end mid-line; each stream gets its own carry buffer and
/// lines are completed on either `\n` or `\r` (the backend redraws its
/// progress line with bare carriage returns).
pub struct OutputParser {
    grammar: &'static Grammar,
    /// Path the backend most recently named; progress ticks apply here.
    current_path: Option<String>,
    /// Set once the first copy banner was seen. Path announcements
    /// before that are inspection noise, not copies.
    copying: bool,
    stdout_carry: Vec<u8>,
    stderr_carry: Vec<u8>,
}

impl OutputParser {
    pub fn new(grammar: &'static Grammar) -> Self {
        OutputParser {
            grammar,
            current_path: None,
            copying: false,
            stdout_carry: Vec::new(),
            stderr_carry: Vec::new(),
        }
    }

    /// Consume one chunk from one stream, returning every line it
    /// completed.
    pub fn feed(&mut self, stream: Stream, chunk: &[u8]) -> Vec<ParsedLine> {
        let carry = match stream {
            Stream::Stdout => &mut self.stdout_carry,
            Stream::Stderr => &mut self.stderr_carry,
        };
        carry.extend_from_slice(chunk);

        let mut complete = Vec::new();
        let mut start = 0;
        for (i, byte) in carry.iter().enumerate() {
            if *byte == b'\n' || *byte == b'\r' {
                if i > start {
                    complete.push(String::from_utf8_lossy(&carry[start..i]).into_owned());
                }
                start = i + 1;
            }
        }
        let rest = carry.split_off(start);
        *carry = rest;

        complete.into_iter().map(|line| self.parse_line(line)).collect()
    }

    /// Flush whatever is left in the carry buffers once both streams hit
    /// EOF, so a final unterminated line is not lost.
    pub fn finish(&mut self) -> Vec<ParsedLine> {
        let mut lines = Vec::new();
        for carry in [
            std::mem::take(&mut self.stdout_carry),
            std::mem::take(&mut self.stderr_carry),
        ] {
            if !carry.is_empty() {
                lines.push(String::from_utf8_lossy(&carry).into_owned());
            }
        }
        lines.into_iter().map(|line| self.parse_line(line)).collect()
    }

    fn parse_line(&mut self, raw: String) -> ParsedLine {
        let update = self.recognize(&raw);
        ParsedLine { raw, update }
    }

    fn recognize(&mut self, line: &str) -> Option<Update> {
        let g = self.grammar;

        if let Some(caps) = g.copy_disk.captures(line) {
            let index: usize = caps[1].parse().ok()?;
            let total: usize = caps[2].parse().ok()?;
            self.copying = true;
            self.current_path = None;
            return Some(Update::CopyDisk { index, total });
        }

        if let Some(caps) = g.nbdkit_disk_path.captures(line) {
            return self.name_path(caps[1].to_string());
        }

        if let Some(caps) = g.overlay_source.captures(line) {
            let path = g.datastore_path(&caps[1]);
            return self.name_path(path);
        }

        if let Some(caps) = g.overlay_backing.captures(line) {
            let path = g.datastore_path(&caps[1]);
            return self.name_path(path);
        }

        if let Some(caps) = g.disk_progress.captures(line) {
            let percent: f64 = caps[1].parse().ok()?;
            return match (&self.current_path, self.copying) {
                (Some(path), true) => Some(Update::Progress {
                    path: path.clone(),
                    percent,
                }),
                _ => {
                    log::debug!("Skipping progress update for unknown disk");
                    None
                }
            };
        }

        if let Some(caps) = g.fatal_error.captures(line) {
            return Some(Update::FatalError {
                message: caps[1].to_string(),
            });
        }

        // Machine-readable mode interleaves JSON messages with the text
        // output.
        if line.starts_with('{') {
            if let Ok(msg) = serde_json::from_str::<MachineMessage>(line) {
                if msg.kind == "error" {
                    return Some(Update::FatalError {
                        message: msg.message.unwrap_or_else(|| line.to_string()),
                    });
                }
            }
        }

        None
    }

    /// Record a newly named path. Before the first copy banner this is
    /// only bookkeeping for later progress ticks, not a copy start.
    fn name_path(&mut self, path: String) -> Option<Update> {
        self.current_path = Some(path.clone());
        if self.copying {
            Some(Update::DiskPath { path })
        } else {
            None
        }
    }
}
