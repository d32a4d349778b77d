//! Job execution inside an assembled environment.
//!
//! A job runs a list of commands with the host environment wiped out:
//! every variable the commands see comes from the imports, the job's
//! `env`/`env_nohash` sections and the base variables (`ARTIFACT`, `BUILD`,
//! `PATH`, `HDIST_CFLAGS`, `HDIST_LDFLAGS`, `HDIST_VIRTUALS`). The first
//! command of a spec is required (by validation) to launch a process image
//! from inside the sandbox, so nothing from the host leaks in through the
//! process tree either.
//!
//! All stdout and stderr is tee'd to `$BUILD/build.log`; a command may
//! instead capture its stdout into a variable (`to_var`) visible to later
//! commands, or receive a JSON document on stdin (`inputs`).

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::build_spec::{ArtifactId, VIRTUAL_PREFIX};
use crate::build_store::{BuildStore, StoreError};
use crate::fileutil::relative_path;

/// Name of the log file inside the build directory.
pub const BUILD_LOG: &str = "build.log";

#[derive(Debug, Error)]
pub enum SubstError {
  #[error("no such variable in substitution: '{0}'")]
  UnknownVariable(String),

  #[error("'$$' is not allowed (no variable can be named '$'): {0}")]
  DollarDollar(String),

  #[error("stray '$' without a variable name: {0}")]
  StrayDollar(String),
}

#[derive(Debug, Error)]
pub enum JobError {
  #[error("import '{id}' is not a valid artifact id")]
  BadImportId { id: String },

  #[error("virtual import '{alias}' was not provided a concrete artifact")]
  UnresolvedVirtual { alias: String },

  /// The core never recurses to build dependencies; the caller must have
  /// built them first.
  #[error("import '{id}' is not present in the store; build it first")]
  UnresolvedImport { id: String },

  #[error("import '{id}' appears twice")]
  DuplicateImport { id: String },

  #[error("'before' constraints of the imports form a cycle")]
  ImportCycle,

  #[error("command {index} has an empty 'cmd' list")]
  EmptyCommand { index: usize },

  #[error(transparent)]
  Subst(#[from] SubstError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("failed to launch '{cmd}': {source}")]
  Spawn {
    cmd: String,
    #[source]
    source: std::io::Error,
  },

  #[error("command {index} ('{cmd}') failed with code {code:?}; see {log_path}")]
  CommandFailed {
    index: usize,
    cmd: String,
    code: Option<i32>,
    log_path: PathBuf,
  },

  #[error("command '{cmd}' exceeded its timeout of {secs}s")]
  Timeout { cmd: String, secs: u64 },

  #[error("{op} '{path}': {source}")]
  Io {
    op: &'static str,
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// The `build` sub-document of a build spec, in canonical form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSpec {
  #[serde(default)]
  pub import: Vec<ImportSpec>,
  #[serde(default)]
  pub env: BTreeMap<String, String>,
  #[serde(default)]
  pub env_nohash: BTreeMap<String, String>,
  #[serde(default)]
  pub commands: Vec<CommandSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSpec {
  /// Variable name the artifact is bound to (`${ref}`, `${ref}_id`,
  /// `${ref}_relpath`).
  #[serde(rename = "ref")]
  pub ref_name: String,
  /// Artifact id, or `virtual:<alias>` resolved through the caller's table.
  pub id: String,
  /// Ids this import must precede in the environment ordering.
  #[serde(default)]
  pub before: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandSpec {
  pub cmd: Vec<String>,
  /// Per-command environment overrides, substituted against the job env.
  #[serde(default)]
  pub env: BTreeMap<String, String>,
  /// Working directory relative to the build dir (default: the build dir).
  #[serde(default)]
  pub cwd: Option<String>,
  /// Capture trimmed stdout into this variable for later commands.
  #[serde(default)]
  pub to_var: Option<String>,
  /// JSON document piped to stdin.
  #[serde(default)]
  pub inputs: Option<Value>,
  /// Kill the command and fail the job after this many seconds.
  #[serde(default)]
  pub timeout_secs: Option<u64>,
}

/// Substitute `$VAR` / `${VAR}` in `s` from `env`.
///
/// `\$` escapes a literal dollar; `$$` is rejected outright; an unknown
/// variable is an error rather than an empty string.
pub fn substitute(s: &str, env: &BTreeMap<String, String>) -> Result<String, SubstError> {
  let mut out = String::with_capacity(s.len());
  let mut chars = s.chars().peekable();
  while let Some(c) = chars.next() {
    if c == '\\' && chars.peek() == Some(&'$') {
      chars.next();
      out.push('$');
      continue;
    }
    if c != '$' {
      out.push(c);
      continue;
    }
    match chars.peek() {
      Some('$') => return Err(SubstError::DollarDollar(s.to_string())),
      Some('{') => {
        chars.next();
        let mut name = String::new();
        for c in chars.by_ref() {
          if c == '}' {
            break;
          }
          name.push(c);
        }
        out.push_str(lookup(&name, env)?);
      }
      Some(c) if c.is_ascii_alphabetic() || *c == '_' => {
        let mut name = String::new();
        while let Some(c) = chars.peek() {
          if c.is_ascii_alphanumeric() || *c == '_' {
            name.push(*c);
            chars.next();
          } else {
            break;
          }
        }
        out.push_str(lookup(&name, env)?);
      }
      _ => return Err(SubstError::StrayDollar(s.to_string())),
    }
  }
  Ok(out)
}

fn lookup<'a>(name: &str, env: &'a BTreeMap<String, String>) -> Result<&'a str, SubstError> {
  env
    .get(name)
    .map(String::as_str)
    .ok_or_else(|| SubstError::UnknownVariable(name.to_string()))
}

/// Encode the virtuals table for `HDIST_VIRTUALS`:
/// `virtual:unix=unix/r0/Kali...;virtual:hdist=hdist/r0/sLt4...`.
pub fn pack_virtuals_envvar(virtuals: &BTreeMap<String, ArtifactId>) -> String {
  virtuals
    .iter()
    .map(|(alias, id)| format!("{}={}", alias, id))
    .collect::<Vec<_>>()
    .join(";")
}

/// Stable topological sort of imports by their `before` constraints.
///
/// Declaration order is the tiebreak, so the output is deterministic for
/// any input. Cycles and duplicate ids are errors.
pub fn stable_topological_sort(imports: &[ImportSpec]) -> Result<Vec<&ImportSpec>, JobError> {
  let mut order: BTreeMap<&str, usize> = BTreeMap::new();
  for (i, imp) in imports.iter().enumerate() {
    if order.insert(imp.id.as_str(), i).is_some() {
      return Err(JobError::DuplicateImport { id: imp.id.clone() });
    }
  }

  let mut roots: Vec<&ImportSpec> = imports
    .iter()
    .filter(|imp| !imports.iter().any(|other| other.before.contains(&imp.id)))
    .collect();
  roots.sort_by_key(|imp| order[imp.id.as_str()]);

  let mut result: Vec<&ImportSpec> = Vec::new();
  fn dfs<'a>(
    imp: &'a ImportSpec,
    imports: &'a [ImportSpec],
    order: &BTreeMap<&str, usize>,
    result: &mut Vec<&'a ImportSpec>,
  ) {
    if result.iter().any(|r| r.id == imp.id) {
      return;
    }
    result.push(imp);
    let mut children: Vec<&ImportSpec> = imp
      .before
      .iter()
      .filter_map(|id| imports.iter().find(|other| &other.id == id))
      .collect();
    children.sort_by_key(|c| order[c.id.as_str()]);
    for child in children {
      dfs(child, imports, order, result);
    }
  }
  for root in roots {
    dfs(root, imports, &order, &mut result);
  }

  if result.len() != imports.len() {
    return Err(JobError::ImportCycle);
  }
  Ok(result)
}

/// Assemble the full sandbox environment for a job.
pub fn assemble_env(
  store: &BuildStore,
  virtuals: &BTreeMap<String, ArtifactId>,
  job: &JobSpec,
  build_dir: &Path,
  artifact_dir: &Path,
) -> Result<BTreeMap<String, String>, JobError> {
  let imports = stable_topological_sort(&job.import)?;

  let mut env = BTreeMap::new();
  let mut path_dirs: Vec<String> = Vec::new();
  let mut cflags: Vec<String> = Vec::new();
  let mut ldflags: Vec<String> = Vec::new();

  for imp in imports {
    let concrete: ArtifactId = if imp.id.starts_with(VIRTUAL_PREFIX) {
      virtuals
        .get(&imp.id)
        .cloned()
        .ok_or_else(|| JobError::UnresolvedVirtual { alias: imp.id.clone() })?
    } else {
      imp
        .id
        .parse()
        .map_err(|_| JobError::BadImportId { id: imp.id.clone() })?
    };
    let dir = store
      .resolve_id(&concrete)?
      .ok_or_else(|| JobError::UnresolvedImport { id: concrete.to_string() })?;

    env.insert(imp.ref_name.clone(), dir.to_string_lossy().into_owned());
    env.insert(format!("{}_id", imp.ref_name), concrete.to_string());
    env.insert(
      format!("{}_relpath", imp.ref_name),
      relative_path(build_dir, &dir).to_string_lossy().into_owned(),
    );

    // PATH only collects imports that opted in through their
    // import-modify-env metadata; compiler flags are directory-driven.
    let meta = store.read_artifact_meta(&dir)?;
    let bin_dir = dir.join("bin");
    if meta.modifies_import_env() && bin_dir.is_dir() {
      path_dirs.push(bin_dir.to_string_lossy().into_owned());
    }
    let include_dir = dir.join("include");
    if include_dir.is_dir() {
      cflags.push(format!("-I{}", include_dir.display()));
    }
    let lib_dir = dir.join("lib");
    if lib_dir.is_dir() {
      ldflags.push(format!("-L{}", lib_dir.display()));
      ldflags.push(format!("-Wl,-R,{}", lib_dir.display()));
    }
  }

  env.insert("PATH".to_string(), path_dirs.join(":"));
  env.insert("HDIST_CFLAGS".to_string(), cflags.join(" "));
  env.insert("HDIST_LDFLAGS".to_string(), ldflags.join(" "));
  env.insert("HDIST_VIRTUALS".to_string(), pack_virtuals_envvar(virtuals));
  env.insert(
    "ARTIFACT".to_string(),
    artifact_dir.to_string_lossy().into_owned(),
  );
  env.insert("BUILD".to_string(), build_dir.to_string_lossy().into_owned());

  // The one host variable that survives the scrub: in-build `hit` helper
  // commands need to locate the store configuration. It never enters any
  // hash.
  if let Ok(config) = std::env::var(crate::config::CONFIG_ENV_VAR) {
    env.insert(crate::config::CONFIG_ENV_VAR.to_string(), config);
  }

  for (key, value) in job.env.iter().chain(job.env_nohash.iter()) {
    env.insert(key.clone(), substitute(value, &env)?);
  }
  Ok(env)
}

/// Run a job: assemble the environment and execute its commands in order.
///
/// Returns the final environment (as modified by `to_var` captures).
pub fn run_job(
  store: &BuildStore,
  virtuals: &BTreeMap<String, ArtifactId>,
  job: &JobSpec,
  build_dir: &Path,
  artifact_dir: &Path,
) -> Result<BTreeMap<String, String>, JobError> {
  let env = assemble_env(store, virtuals, job, build_dir, artifact_dir)?;
  execute_commands(&job.commands, env, build_dir)
}

/// Execute commands against an already-assembled environment.
pub(crate) fn execute_commands(
  commands: &[CommandSpec],
  mut env: BTreeMap<String, String>,
  build_dir: &Path,
) -> Result<BTreeMap<String, String>, JobError> {
  let log_path = build_dir.join(BUILD_LOG);
  let log = File::options()
    .create(true)
    .append(true)
    .open(&log_path)
    .map_err(|source| JobError::Io { op: "open", path: log_path.clone(), source })?;
  let log = Arc::new(Mutex::new(log));

  for (index, command) in commands.iter().enumerate() {
    // Spec validation already rejects this; guard anyway so a
    // hand-constructed job can never index into an empty argv.
    if command.cmd.is_empty() {
      return Err(JobError::EmptyCommand { index });
    }
    // Per-command env overrides substitute against the parent env, so
    // their declaration order never matters.
    let mut line_env = env.clone();
    for (key, value) in &command.env {
      line_env.insert(key.clone(), substitute(value, &env)?);
    }
    let args: Vec<String> = command
      .cmd
      .iter()
      .map(|a| substitute(a, &line_env))
      .collect::<Result<_, _>>()?;
    let cwd = match &command.cwd {
      Some(rel) => build_dir.join(substitute(rel, &line_env)?),
      None => build_dir.to_path_buf(),
    };

    log_line(&log, &format!("hit: running {:?}", args));
    let stdout = run_one(command, &args, &line_env, &cwd, &log, &log_path, index)?;
    if let Some(var) = &command.to_var {
      env.insert(var.clone(), stdout.trim().to_string());
    }
  }
  log_line(&log, "hit: all commands succeeded");
  Ok(env)
}

fn run_one(
  command: &CommandSpec,
  args: &[String],
  env: &BTreeMap<String, String>,
  cwd: &Path,
  log: &Arc<Mutex<File>>,
  log_path: &Path,
  index: usize,
) -> Result<String, JobError> {
  let cmd_display = args.join(" ");
  debug!(cmd = %cmd_display, cwd = %cwd.display(), "running command");

  // A first token of 'hit' re-invokes this executable: the in-tree helper
  // subcommands are available without putting anything on PATH.
  let program: PathBuf = if args[0] == "hit" {
    std::env::current_exe().map_err(|source| JobError::Spawn {
      cmd: cmd_display.clone(),
      source,
    })?
  } else {
    PathBuf::from(&args[0])
  };

  let mut cmd = Command::new(&program);
  cmd
    .args(&args[1..])
    .current_dir(cwd)
    .env_clear()
    .envs(env)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());
  if command.inputs.is_some() {
    cmd.stdin(Stdio::piped());
  }

  let mut child = cmd.spawn().map_err(|source| JobError::Spawn {
    cmd: cmd_display.clone(),
    source,
  })?;

  if let Some(inputs) = &command.inputs {
    let mut stdin = child.stdin.take().expect("stdin was piped");
    let doc = serde_json::to_vec(inputs).expect("inputs is plain JSON");
    // A command that never reads stdin must not deadlock us.
    let _ = stdin.write_all(&doc);
    drop(stdin);
  }

  let capture = command.to_var.is_some();
  let stdout_pipe = child.stdout.take().expect("stdout was piped");
  let stderr_pipe = child.stderr.take().expect("stderr was piped");

  let stdout_log = Arc::clone(log);
  let stdout_thread = std::thread::spawn(move || {
    if capture {
      let mut buf = String::new();
      let mut reader = BufReader::new(stdout_pipe);
      let _ = reader.read_to_string(&mut buf);
      buf
    } else {
      pump_lines(stdout_pipe, stdout_log);
      String::new()
    }
  });
  let stderr_log = Arc::clone(log);
  let stderr_thread = std::thread::spawn(move || pump_lines(stderr_pipe, stderr_log));

  let status = match command.timeout_secs {
    None => child.wait().map_err(|source| JobError::Io {
      op: "wait",
      path: cwd.to_path_buf(),
      source,
    })?,
    Some(secs) => {
      let deadline = Instant::now() + Duration::from_secs(secs);
      loop {
        match child.try_wait().map_err(|source| JobError::Io {
          op: "wait",
          path: cwd.to_path_buf(),
          source,
        })? {
          Some(status) => break status,
          None if Instant::now() >= deadline => {
            warn!(cmd = %cmd_display, secs, "command timed out, killing");
            let _ = child.kill();
            let _ = child.wait();
            let _ = stdout_thread.join();
            let _ = stderr_thread.join();
            return Err(JobError::Timeout { cmd: cmd_display, secs });
          }
          None => std::thread::sleep(Duration::from_millis(50)),
        }
      }
    }
  };

  let stdout = stdout_thread.join().unwrap_or_default();
  let _ = stderr_thread.join();

  if !status.success() {
    log_line(log, &format!("hit: command FAILED with {:?}", status.code()));
    return Err(JobError::CommandFailed {
      index,
      cmd: cmd_display,
      code: status.code(),
      log_path: log_path.to_path_buf(),
    });
  }
  Ok(stdout)
}

fn pump_lines<R: Read>(pipe: R, log: Arc<Mutex<File>>) {
  let reader = BufReader::new(pipe);
  for line in reader.lines() {
    match line {
      Ok(line) => {
        debug!(target: "build", "{}", line);
        if let Ok(mut f) = log.lock() {
          let _ = writeln!(f, "{}", line);
        }
      }
      Err(_) => break,
    }
  }
}

fn log_line(log: &Arc<Mutex<File>>, line: &str) {
  if let Ok(mut f) = log.lock() {
    let _ = writeln!(f, "{}", line);
  }
}
