//! Per-task runtime sandbox preparation: data directory, runtime directory,
//! settings bundle, secrets vault, and launch script.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::{json, Map, Value};
use tracing::instrument;

use flowexec_shared::config::ExecutorConfig;
use flowexec_shared::error::{FlowError, FlowResult};
use flowexec_shared::json_coerce::coerce_to_json;

use crate::engine_registry::ExecutorHandle;

const SECRETS_DIR_MODE: u32 = 0o300;
const SECRET_FILE_MODE: u32 = 0o600;
const SCRIPT_FILE_MODE: u32 = 0o700;
const MANIFEST_FILE: &str = "manifest.json";
const EXECUTOR_SETTINGS_FILE: &str = "executor_settings.json";
const HOST_SETTINGS_FILE: &str = "host_settings.json";
const PROCESS_META_FILE: &str = "process_meta.json";
const DATA_META_FILE: &str = "data_meta.json";
const SCRIPT_FILE: &str = "script.sh";
const SECRETS_SUBDIR: &str = "secrets";
const EXECUTORS_SUBDIR: &str = "executors";

/// Additional settings files and secrets an engine wants written alongside
/// the manifest's standard set. Engines contribute these via
/// [`SandboxBuilder::build`]'s `extend_settings` parameter rather than the
/// builder knowing about any particular engine.
#[derive(Debug, Default)]
pub struct SettingsExtension {
    pub files: HashMap<String, Value>,
    pub secrets: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedSandbox {
    pub data_dir: PathBuf,
    pub runtime_dir: PathBuf,
    /// `["/bin/bash", "-c", "<python> -m executors <relative_module>"]`
    pub argv: [String; 3],
}

/// Builds the on-disk sandbox for exactly one task per call.
///
/// The process umask is forced to 0 while secrets are written so the
/// create-exclusive `0o600` mode request is not narrowed by an ambient
/// umask; a process-wide mutex serializes this against other sandbox
/// builds in the same process, since `umask` is a process-global setting
/// with no per-thread scoping in POSIX. Cross-process interleaving is
/// still correct because the create-exclusive flag plus a final `chmod`
/// fixes the outcome regardless of umask.
#[derive(Debug)]
pub struct SandboxBuilder {
    config: ExecutorConfig,
    executor_package_dir: PathBuf,
    umask_guard: Mutex<()>,
}

impl SandboxBuilder {
    pub fn new(config: ExecutorConfig, executor_package_dir: PathBuf) -> Self {
        Self {
            config,
            executor_package_dir,
            umask_guard: Mutex::new(()),
        }
    }

    #[instrument(skip(self, extension), fields(task_id))]
    pub fn build(
        &self,
        task_id: i64,
        program: &str,
        executor: &ExecutorHandle,
        host_url: &str,
        extension: SettingsExtension,
    ) -> FlowResult<PreparedSandbox> {
        let data_dir = self.prepare_data_dir(task_id)?;
        let runtime_dir = self.prepare_runtime_dir(task_id)?;
        self.write_settings_bundle(&runtime_dir, task_id, &data_dir, &extension.files)?;
        self.write_secrets(&runtime_dir, &extension.secrets)?;
        self.write_script(&runtime_dir, program, host_url)?;
        let argv = self.launch_argv(executor);

        Ok(PreparedSandbox {
            data_dir,
            runtime_dir,
            argv,
        })
    }

    fn prepare_data_dir(&self, task_id: i64) -> FlowResult<PathBuf> {
        let dir = Path::new(&self.config.data_dir).join(task_id.to_string());
        fs::create_dir_all(&dir).map_err(|e| FlowError::from_sandbox_io(e, "create data dir"))?;
        // Creation mode is not guaranteed to stick through the caller's
        // umask, so it is re-applied explicitly.
        fs::set_permissions(&dir, fs::Permissions::from_mode(self.config.data_dir_mode))
            .map_err(|e| FlowError::from_sandbox_io(e, "chmod data dir"))?;
        Ok(dir)
    }

    fn prepare_runtime_dir(&self, task_id: i64) -> FlowResult<PathBuf> {
        let dir = Path::new(&self.config.runtime_dir).join(task_id.to_string());
        fs::create_dir_all(&dir)
            .map_err(|e| FlowError::from_sandbox_io(e, "create runtime dir"))?;

        let executors_dest = dir.join(EXECUTORS_SUBDIR);
        copy_dir_recursive(&self.executor_package_dir, &executors_dest)
            .map_err(|e| FlowError::from_sandbox_io(e, "copy executor package"))?;

        fs::set_permissions(&dir, fs::Permissions::from_mode(self.config.runtime_dir_mode))
            .map_err(|e| FlowError::from_sandbox_io(e, "chmod runtime dir"))?;
        Ok(dir)
    }

    fn write_settings_bundle(
        &self,
        runtime_dir: &Path,
        task_id: i64,
        data_dir: &Path,
        extra_files: &HashMap<String, Value>,
    ) -> FlowResult<()> {
        let executor_settings = json!({
            "data_dir": coerce_to_json(&data_dir.to_string_lossy().to_string(), || "".into()),
            "control_channel": format!("flowexec.control.{task_id}"),
        });
        let host_settings: Map<String, Value> = self
            .config
            .set_env
            .iter()
            .map(|(k, v)| (k.clone(), coerce_to_json(v, || v.clone())))
            .collect();
        let process_meta = json!({
            "scheduling_classes": ["interactive", "batch"],
        });
        let data_meta = json!({
            "statuses": ["RESOLVING", "WAITING", "PROCESSING", "DONE", "ERROR"],
        });

        let mut manifest_files = vec![
            EXECUTOR_SETTINGS_FILE.to_string(),
            HOST_SETTINGS_FILE.to_string(),
            PROCESS_META_FILE.to_string(),
            DATA_META_FILE.to_string(),
        ];

        self.write_json(runtime_dir, EXECUTOR_SETTINGS_FILE, &executor_settings)?;
        self.write_json(runtime_dir, HOST_SETTINGS_FILE, &Value::Object(host_settings))?;
        self.write_json(runtime_dir, PROCESS_META_FILE, &process_meta)?;
        self.write_json(runtime_dir, DATA_META_FILE, &data_meta)?;

        for (name, value) in extra_files {
            self.write_json(runtime_dir, name, value)?;
            manifest_files.push(name.clone());
        }

        let manifest = json!({ "files": manifest_files });
        self.write_json(runtime_dir, MANIFEST_FILE, &manifest)
    }

    fn write_json(&self, runtime_dir: &Path, file_name: &str, value: &Value) -> FlowResult<()> {
        let path = runtime_dir.join(file_name);
        let bytes =
            serde_json::to_vec_pretty(value).map_err(|e| FlowError::OsError(e.to_string()))?;
        fs::write(&path, bytes).map_err(|e| FlowError::from_sandbox_io(e, "write settings file"))
    }

    fn write_secrets(&self, runtime_dir: &Path, secrets: &HashMap<String, String>) -> FlowResult<()> {
        let secrets_dir = runtime_dir.join(SECRETS_SUBDIR);
        fs::create_dir_all(&secrets_dir)
            .map_err(|e| FlowError::from_sandbox_io(e, "create secrets dir"))?;

        // umask(0) is process-global; hold the guard for the whole batch of
        // secret writes so no other sandbox build in this process observes
        // a narrowed umask mid-write.
        let _guard = self.umask_guard.lock().unwrap();
        // SAFETY: `umask` has no memory-safety requirements; it only reads
        // and atomically swaps a per-process field in the kernel. The prior
        // value is always restored before returning, including on error,
        // via the `restore` closure run at every exit path below.
        let previous_umask = unsafe { libc::umask(0) };
        let result = self.write_secrets_inner(&secrets_dir, secrets);
        // SAFETY: same invariants as above; restores the caller's umask.
        unsafe { libc::umask(previous_umask) };
        result?;

        fs::set_permissions(&secrets_dir, fs::Permissions::from_mode(SECRETS_DIR_MODE))
            .map_err(|e| FlowError::from_sandbox_io(e, "chmod secrets dir"))?;
        Ok(())
    }

    fn write_secrets_inner(
        &self,
        secrets_dir: &Path,
        secrets: &HashMap<String, String>,
    ) -> FlowResult<()> {
        for (name, value) in secrets {
            let path = secrets_dir.join(name);
            // `create_new` makes this atomically create-or-fail, closing the
            // TOCTOU window where an attacker could pre-create the file
            // with looser permissions before we chmod it.
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(SECRET_FILE_MODE)
                .open(&path)
                .map_err(|e| FlowError::from_sandbox_io(e, format!("create secret {name}")))?;
            use std::io::Write;
            file.write_all(value.as_bytes())
                .map_err(|e| FlowError::from_sandbox_io(e, format!("write secret {name}")))?;
            fs::set_permissions(&path, fs::Permissions::from_mode(SECRET_FILE_MODE))
                .map_err(|e| FlowError::from_sandbox_io(e, format!("chmod secret {name}")))?;
        }
        Ok(())
    }

    fn write_script(&self, runtime_dir: &Path, program: &str, host_url: &str) -> FlowResult<()> {
        let mut env_lines = vec![format!("export RESOLWE_HOST_URL=\"{host_url}\"")];
        for (key, value) in &self.config.set_env {
            env_lines.push(format!("export {key}=\"{value}\""));
        }
        let script = format!("{}\n{program}\n", env_lines.join("\n"));

        let path = runtime_dir.join(SCRIPT_FILE);
        fs::write(&path, script).map_err(|e| FlowError::from_sandbox_io(e, "write script"))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(SCRIPT_FILE_MODE))
            .map_err(|e| FlowError::from_sandbox_io(e, "chmod script"))?;
        Ok(())
    }

    fn launch_argv(&self, executor: &ExecutorHandle) -> [String; 3] {
        [
            "/bin/bash".to_string(),
            "-c".to_string(),
            format!(
                "{} -m executors {}",
                self.config.python, executor.dotted_name
            ),
        ]
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    if !src.exists() {
        // The reference package tree is optional in this crate (it ships
        // no actual executor payload); an absent source is a no-op copy.
        fs::create_dir_all(dst)?;
        return Ok(());
    }
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let dest_path = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &dest_path)?;
        } else {
            fs::copy(entry.path(), dest_path)?;
        }
    }
    Ok(())
}
