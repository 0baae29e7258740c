//! Symbol resolution through a GDB subprocess in machine-interface mode.
//!
//! The resolver extracts variable addresses and primitive types from a
//! compiled executable by issuing three commands (`info variables`,
//! `ptype <expr>`, `p /d &<expr>`) and scraping their textual output.
//! MI wraps console lines in `~"..."` with the newline escaped, so the
//! scraper looks for the literal two-character `\n` sequence.
//!
//! The output format is not strict; unexpected lines are skipped and a
//! variable that fails any step is marked not-found rather than
//! aborting the pass.

use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use log::{debug, error, info, warn};

use crate::vars::{VarType, VariableHandler};

/// MI response terminator.
pub const GDB_PROMPT: &str = "(gdb)";

/// Names longer than this abort the aggregate recursion.
const MAX_TRACKED_NAME: usize = 100;

/// A command/response session with the debugger. The contract is
/// deliberately thin: execute a command, stream stdout until a marker
/// line appears.
pub trait MiSession: Send {
    /// Writes `cmd` and accumulates stdout up to and including the line
    /// carrying `terminator`.
    fn execute(&mut self, cmd: &str, terminator: &str) -> io::Result<String>;

    fn close(&mut self);
}

/// [`MiSession`] over a real `gdb --interpreter=mi` subprocess.
pub struct GdbMiProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl GdbMiProcess {
    /// Spawns the debugger on `elf_path` and consumes the banner.
    pub fn spawn(gdb_command: &str, elf_path: &Path) -> io::Result<Self> {
        let mut child = Command::new(gdb_command)
            .arg("--interpreter=mi")
            .arg(elf_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "no stdin pipe"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "no stdout pipe"))?;

        let mut process = GdbMiProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        };
        process.read_until(GDB_PROMPT)?;
        Ok(process)
    }

    fn read_until(&mut self, terminator: &str) -> io::Result<String> {
        let mut accumulated = String::new();
        loop {
            let mut line = String::new();
            if self.stdout.read_line(&mut line)? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "debugger closed the pipe",
                ));
            }
            accumulated.push_str(&line);
            if line.contains(terminator) {
                return Ok(accumulated);
            }
        }
    }
}

impl MiSession for GdbMiProcess {
    fn execute(&mut self, cmd: &str, terminator: &str) -> io::Result<String> {
        self.stdin.write_all(cmd.as_bytes())?;
        if !cmd.ends_with('\n') {
            self.stdin.write_all(b"\n")?;
        }
        self.stdin.flush()?;
        self.read_until(terminator)
    }

    fn close(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for GdbMiProcess {
    fn drop(&mut self) {
        self.close();
    }
}

/// Address and primitive type of a resolved variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolRecord {
    pub address: u32,
    pub var_type: VarType,
}

#[derive(Debug, thiserror::Error)]
pub enum SymbolError {
    /// The configured GDB binary did not identify itself as GNU gdb.
    #[error("GDB executable failed validation; check the GDB path in the acquisition settings")]
    BadGdb,

    #[error("ELF file not found: {0}")]
    ElfNotFound(PathBuf),

    /// A disconnected pipe mid-parse surfaces here and is treated as a
    /// failed parse.
    #[error("debugger I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Drives the debugger and maintains the name to address/type mapping.
pub struct SymbolResolver {
    gdb_command: String,
}

impl SymbolResolver {
    pub fn new(gdb_command: impl Into<String>) -> Self {
        SymbolResolver {
            gdb_command: gdb_command.into(),
        }
    }

    pub fn set_gdb_command(&mut self, command: impl Into<String>) {
        self.gdb_command = command.into();
    }

    /// Checks that the configured binary is a GNU gdb. No queries are
    /// issued when this fails.
    pub fn validate_gdb(&self) -> bool {
        let output = Command::new(&self.gdb_command)
            .arg("-v")
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).into_owned())
            .unwrap_or_default();

        if output.contains("GNU") || output.contains("gnu") {
            info!("GDB executable working");
            true
        } else {
            error!("GDB executable error; check the GDB path in the acquisition settings");
            false
        }
    }

    /// Walks every top-level variable reported by the debugger,
    /// recursing into aggregates, and returns the primitive ones.
    pub fn parse(&self, elf_path: &Path) -> Result<BTreeMap<String, SymbolRecord>, SymbolError> {
        if !self.validate_gdb() {
            return Err(SymbolError::BadGdb);
        }
        if !elf_path.exists() {
            return Err(SymbolError::ElfNotFound(elf_path.to_path_buf()));
        }

        let mut session = GdbMiProcess::spawn(&self.gdb_command, elf_path)?;
        let records = self.parse_session(&mut session);
        session.close();
        Ok(records?)
    }

    /// Refreshes address and type of the already-registered variables
    /// flagged for ELF updates. Variables that fail any query stay
    /// marked not-found.
    pub fn update_variable_map(
        &self,
        elf_path: &Path,
        vars: &VariableHandler,
    ) -> Result<(), SymbolError> {
        if !self.validate_gdb() {
            return Err(SymbolError::BadGdb);
        }
        if !elf_path.exists() {
            return Err(SymbolError::ElfNotFound(elf_path.to_path_buf()));
        }

        let mut session = GdbMiProcess::spawn(&self.gdb_command, elf_path)?;
        let result = self.update_session(&mut session, vars);
        session.close();
        Ok(result?)
    }

    /// [`parse`](Self::parse) against an already-open session.
    pub fn parse_session(
        &self,
        session: &mut dyn MiSession,
    ) -> io::Result<BTreeMap<String, SymbolRecord>> {
        let out = session.execute("info variables\n", GDB_PROMPT)?;
        let mut records = BTreeMap::new();

        // Walk the per-file blocks. A block runs from its "File" marker
        // line down to the next empty console line (the literal
        // `~"\n`). Anything that does not follow the shape is skipped.
        let mut start = 0;
        loop {
            let file_pos = match find_from(&out, "File", start) {
                Some(pos) => pos,
                None => break,
            };
            start = match find_from(&out, "~", file_pos) {
                Some(pos) => pos + 2, // skip the tilde and the quote
                None => break,
            };
            let end = match find_from(&out, ":", start) {
                Some(pos) => pos,
                None => break,
            };

            start = end;
            if let Some(chunk_end) = find_from(&out, "~\"\\n", end) {
                self.scan_variable_chunk(session, &out[start..chunk_end], &mut records)?;
                start = chunk_end;
            }
        }

        Ok(records)
    }

    /// [`update_variable_map`](Self::update_variable_map) against an
    /// already-open session.
    pub fn update_session(
        &self,
        session: &mut dyn MiSession,
        vars: &VariableHandler,
    ) -> io::Result<()> {
        let tracked: Vec<(String, String)> = vars.with(|list| {
            list.iter()
                .filter(|v| v.should_update_from_elf())
                .map(|v| (v.name().to_string(), v.tracked_name().to_string()))
                .collect()
        });

        for (name, tracked_name) in tracked {
            vars.with(|list| {
                if let Some(var) = list.iter_mut().find(|v| v.name() == name) {
                    var.set_is_found(false);
                    var.set_var_type(VarType::Unknown);
                }
            });

            let address = match self.query_address(session, &tracked_name)? {
                Some(address) => address,
                None => continue,
            };
            let (var_type, _) = self.query_type(session, &tracked_name)?;

            vars.with(|list| {
                if let Some(var) = list.iter_mut().find(|v| v.name() == name) {
                    var.set_is_found(true);
                    var.set_address(address);
                    var.set_var_type(var_type);
                }
            });
        }

        Ok(())
    }

    /// Extracts candidate names from one file block (the token left of
    /// each `;`) and probes each.
    fn scan_variable_chunk(
        &self,
        session: &mut dyn MiSession,
        chunk: &str,
        records: &mut BTreeMap<String, SymbolRecord>,
    ) -> io::Result<()> {
        let mut start = 0;
        loop {
            let semicolon = match find_from(chunk, ";", start) {
                Some(pos) => pos,
                None => break,
            };
            let space = match chunk[..semicolon].rfind(' ') {
                Some(pos) => pos,
                None => break,
            };

            let name = chunk[space + 1..semicolon].to_string();
            self.probe_variable(session, name, records)?;
            start = semicolon + 1;
        }
        Ok(())
    }

    /// Resolves one candidate: primitive variables are recorded,
    /// aggregates are walked member by member with dotted names.
    fn probe_variable(
        &self,
        session: &mut dyn MiSession,
        name: String,
        records: &mut BTreeMap<String, SymbolRecord>,
    ) -> io::Result<()> {
        let address = match self.query_address(session, &name)? {
            Some(address) => address,
            None => return Ok(()),
        };

        let (var_type, out) = self.query_type(session, &name)?;
        if var_type != VarType::Unknown {
            records.insert(name, SymbolRecord { address, var_type });
            return Ok(());
        }

        // Aggregate: each member line also ends in a semicolon. Methods
        // close with a parenthesis; `const` members and pointers are
        // skipped.
        let mut start = 0;
        loop {
            let semicolon = match find_from(&out, ";", start) {
                Some(pos) => pos,
                None => break,
            };
            debug!("member scan at {} of {}", semicolon, name);

            if semicolon == 0 || out.as_bytes()[semicolon - 1] == b')' {
                start = semicolon + 1;
                continue;
            }

            let space = match out[..semicolon].rfind(' ') {
                Some(pos) => pos,
                None => break,
            };
            let member = &out[space + 1..semicolon];

            if member == "const" || member.starts_with('*') {
                start = semicolon + 1;
                continue;
            }

            let full_name = format!("{}.{}", name, member);
            if full_name.len() < MAX_TRACKED_NAME {
                self.probe_variable(session, full_name, records)?;
            }

            start = semicolon + 1;
        }

        Ok(())
    }

    /// `p /d &<name>`: scrapes the `$N = <int>` value line. `None` when
    /// the markers are missing; an unparsable integer is logged and
    /// treated as address 0, which is below
    /// [`MIN_ADDRESS`](crate::vars::MIN_ADDRESS) and therefore invalid
    /// downstream.
    fn query_address(
        &self,
        session: &mut dyn MiSession,
        name: &str,
    ) -> io::Result<Option<u32>> {
        let out = session.execute(&format!("p /d &{}\n", name), GDB_PROMPT)?;

        let dollar = match out.find('$') {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let rest = &out[dollar + 1..];
        let equal = match rest.find('=') {
            Some(pos) => pos,
            None => return Ok(None),
        };

        // the escaped newline ends the value; MI emits it as two
        // characters
        let end = rest.find("\\n").unwrap_or(rest.len());
        let text = rest.get(equal + 2..end).unwrap_or("").trim();

        let address = match text.parse::<i64>() {
            Ok(value) if (0..=u32::MAX as i64).contains(&value) => value as u32,
            _ => {
                warn!("unparsable address for {}: {:?}", name, text);
                0
            }
        };

        Ok(Some(address))
    }

    /// `ptype <name>`: returns the resolved primitive type (or
    /// `Unknown`) along with the full response for aggregate walking.
    fn query_type(
        &self,
        session: &mut dyn MiSession,
        name: &str,
    ) -> io::Result<(VarType, String)> {
        let out = session.execute(&format!("ptype {}\n", name), GDB_PROMPT)?;
        let var_type = parse_type_line(&out);
        debug!("type of {}: {:?}", name, var_type);
        Ok((var_type, out))
    }
}

/// Extracts the `type = <...>` line of a `ptype` response and maps it
/// through the primitive-type table.
fn parse_type_line(out: &str) -> VarType {
    let start = match out.find('=') {
        Some(pos) => pos,
        None => return VarType::Unknown,
    };
    let end = find_from(out, "\\n", start).unwrap_or(out.len());
    let line = out.get(start + 2..end).unwrap_or("").trim_start();

    // qualifiers do not change the layout
    let line = line.strip_prefix("volatile ").unwrap_or(line);
    let line = line.strip_prefix("static ").unwrap_or(line);
    let line = line.strip_prefix("const ").unwrap_or(line);

    if line.contains("enum {") {
        return VarType::I32;
    }

    primitive_type(line.trim_end())
}

/// The known-primitives table. This is the full set understood by the
/// resolver; anything else recurses or is marked not-found.
fn primitive_type(name: &str) -> VarType {
    match name {
        "_Bool" | "bool" => VarType::Bool,

        "unsigned char" => VarType::U8,

        "char" | "signed char" => VarType::I8,

        "unsigned short" | "unsigned short int" | "short unsigned int" => VarType::U16,

        "short" | "short int" | "signed short" | "signed short int" | "short signed int" => {
            VarType::I16
        }

        "unsigned int" | "unsigned long" | "unsigned long int" | "long unsigned int" => {
            VarType::U32
        }

        "int" | "long" | "long int" | "signed long" | "signed long int" | "long signed int" => {
            VarType::I32
        }

        "float" => VarType::F32,

        _ => VarType::Unknown,
    }
}

fn find_from(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    haystack
        .get(from..)
        .and_then(|h| h.find(needle).map(|pos| pos + from))
}
