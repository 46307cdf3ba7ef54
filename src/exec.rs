//! Subprocess execution against the content-addressed store.
//!
//! A process request is fully described by digests: its input tree comes
//! out of the store, its outputs (stdout, stderr, captured files) go back
//! in. The action cache keys on a fingerprint of the request including
//! the executable's content, so an edited tool binary misses the cache
//! even when its path is unchanged.

use std::collections::{BTreeMap, HashMap};
use std::process::Command;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::error::ExecError;
use crate::hash::Hash32;
use crate::store::{Digest, Store};

/// One subprocess invocation, described entirely by values.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    /// Program to run. Resolved against PATH when not an absolute path.
    pub executable: String,
    pub args: Vec<String>,
    /// The complete environment; nothing leaks in from the parent.
    pub env: BTreeMap<String, String>,
    /// Tree materialized into the sandbox before the process starts.
    pub input: Digest,
    /// Sandbox-relative paths captured after exit. Paths the process did
    /// not produce are omitted from the output tree.
    pub output_paths: Vec<Utf8PathBuf>,
}

/// What came out of a process. A non-zero exit is a result, not an
/// engine failure; rules decide what exit codes mean.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    pub exit_code: i32,
    pub stdout: Digest,
    pub stderr: Digest,
    /// Tree of the captured output paths.
    pub output: Digest,
}

#[derive(Serialize)]
struct ActionKey<'a> {
    executable: Hash32,
    args: &'a [String],
    env: &'a BTreeMap<String, String>,
    input: Hash32,
}

/// Runs process requests in throwaway sandbox directories, with an
/// in-memory action cache.
pub struct Executor {
    store: Arc<Store>,
    root: Utf8PathBuf,
    cache: Mutex<HashMap<Hash32, ProcessResult>>,
}

impl Executor {
    /// `root` is where sandbox directories are created; it must exist.
    pub fn new(store: Arc<Store>, root: Utf8PathBuf) -> Self {
        Self {
            store,
            root,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the request, or returns the cached result of an identical
    /// earlier run.
    pub fn run(&self, request: &ProcessRequest) -> Result<ProcessResult, ExecError> {
        let action = self.fingerprint(request)?;

        if let Some(hit) = self.cache.lock().unwrap().get(&action) {
            tracing::debug!(executable = %request.executable, action = %action.to_hex(), "action cache hit");
            return Ok(hit.clone());
        }

        let result = self.spawn(request, action)?;
        self.cache.lock().unwrap().insert(action, result.clone());
        Ok(result)
    }

    /// The action cache key. Hashing the executable by content means a
    /// rebuilt tool at the same path is a different action.
    fn fingerprint(&self, request: &ProcessRequest) -> Result<Hash32, ExecError> {
        let executable = Hash32::hash_file(&request.executable)
            .unwrap_or_else(|_| Hash32::hash(request.executable.as_bytes()));

        let key = ActionKey {
            executable,
            args: &request.args,
            env: &request.env,
            input: request.input.hash,
        };

        let mut bytes = Vec::new();
        ciborium::into_writer(&key, &mut bytes).map_err(|source| ExecError::Fingerprint {
            executable: request.executable.clone(),
            source,
        })?;
        Ok(Hash32::hash(&bytes))
    }

    fn spawn(&self, request: &ProcessRequest, action: Hash32) -> Result<ProcessResult, ExecError> {
        let sandbox = self.root.join(action.to_hex());
        if sandbox.exists() {
            std::fs::remove_dir_all(&sandbox).map_err(|source| ExecError::Spawn {
                executable: request.executable.clone(),
                source,
            })?;
        }

        self.store
            .materialize(&request.input, &sandbox)
            .map_err(|source| ExecError::Materialize {
                executable: request.executable.clone(),
                source,
            })?;

        tracing::debug!(executable = %request.executable, %sandbox, "spawning");
        let output = Command::new(&request.executable)
            .args(&request.args)
            .env_clear()
            .envs(&request.env)
            .current_dir(&sandbox)
            .output()
            .map_err(|source| ExecError::Spawn {
                executable: request.executable.clone(),
                source,
            })?;

        let stdout = self.store.put(&output.stdout);
        let stderr = self.store.put(&output.stderr);

        // Declared outputs the process did not produce are silently absent
        // from the snapshot.
        let captured = self
            .store
            .snapshot(&sandbox, &request.output_paths)
            .map_err(|source| ExecError::Capture {
                executable: request.executable.clone(),
                source,
            })?;

        let _ = std::fs::remove_dir_all(&sandbox);

        Ok(ProcessResult {
            // Killed by signal reads as -1.
            exit_code: output.status.code().unwrap_or(-1),
            stdout,
            stderr,
            output: captured,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn executor() -> (Executor, Arc<Store>, tempfile::TempDir) {
        let store = Arc::new(Store::new());
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (Executor::new(store.clone(), root), store, dir)
    }

    fn sh(script: &str, input: Digest, output_paths: Vec<Utf8PathBuf>) -> ProcessRequest {
        ProcessRequest {
            executable: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            env: BTreeMap::new(),
            input,
            output_paths,
        }
    }

    #[test]
    fn test_captures_stdout_and_exit_code() {
        let (executor, store, _dir) = executor();
        let result = executor
            .run(&sh("printf hello", store.empty_tree(), vec![]))
            .unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(&*store.get(&result.stdout).unwrap(), b"hello");
    }

    #[test]
    fn test_nonzero_exit_is_a_result() {
        let (executor, store, _dir) = executor();
        let result = executor
            .run(&sh(
                "printf 'no such flag' >&2; exit 3",
                store.empty_tree(),
                vec![],
            ))
            .unwrap();

        assert_eq!(result.exit_code, 3);
        assert_eq!(&*store.get(&result.stderr).unwrap(), b"no such flag");
    }

    #[test]
    fn test_input_materialized_and_outputs_captured() {
        let (executor, store, _dir) = executor();

        let scratch = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(scratch.path().to_path_buf()).unwrap();
        std::fs::write(root.join("in.txt"), "abc").unwrap();
        let input = store.snapshot(&root, &["in.txt".into()]).unwrap();

        let result = executor
            .run(&sh(
                "tr a-z A-Z < in.txt > out.txt",
                input,
                vec!["out.txt".into()],
            ))
            .unwrap();
        assert_eq!(result.exit_code, 0);

        let dest = tempfile::tempdir().unwrap();
        let dest = Utf8PathBuf::from_path_buf(dest.path().join("tree")).unwrap();
        store.materialize(&result.output, &dest).unwrap();
        assert_eq!(std::fs::read_to_string(dest.join("out.txt")).unwrap(), "ABC");
    }

    #[test]
    fn test_missing_declared_output_is_omitted() {
        let (executor, store, _dir) = executor();
        let result = executor
            .run(&sh(
                "printf x > made.txt",
                store.empty_tree(),
                vec!["made.txt".into(), "never.txt".into()],
            ))
            .unwrap();

        let tree = store.get_tree(&result.output).unwrap();
        assert!(tree.contains_key("made.txt"));
        assert!(!tree.contains_key("never.txt"));
    }

    #[test]
    fn test_action_cache_skips_identical_rerun() {
        let (executor, store, _dir) = executor();

        // The process appends to a file outside the sandbox; a cache hit
        // leaves that side effect at one occurrence.
        let probe = tempfile::tempdir().unwrap();
        let probe_file = probe.path().join("count");
        let script = format!("printf . >> {}", probe_file.display());

        let request = sh(&script, store.empty_tree(), vec![]);
        let first = executor.run(&request).unwrap();
        let second = executor.run(&request).unwrap();

        assert_eq!(first, second);
        assert_eq!(std::fs::read(&probe_file).unwrap().len(), 1);
    }

    #[test]
    fn test_differing_inputs_are_distinct_actions() {
        let (executor, store, _dir) = executor();

        let scratch = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(scratch.path().to_path_buf()).unwrap();

        std::fs::write(root.join("in.txt"), "one").unwrap();
        let a = store.snapshot(&root, &["in.txt".into()]).unwrap();
        std::fs::write(root.join("in.txt"), "two").unwrap();
        let b = store.snapshot(&root, &["in.txt".into()]).unwrap();

        let out_a = executor.run(&sh("cat in.txt", a, vec![])).unwrap();
        let out_b = executor.run(&sh("cat in.txt", b, vec![])).unwrap();

        assert_eq!(&*store.get(&out_a.stdout).unwrap(), b"one");
        assert_eq!(&*store.get(&out_b.stdout).unwrap(), b"two");
    }
}
