//! [`SandboxEngine`] backed by an embedded Rhai interpreter.
//!
//! Each global state is a Rhai [`Scope`], so top-level `let` bindings from
//! one `run` are visible to the next `run` against the same handle. Script
//! output from `print` and `debug` is captured per run. Filesystem access
//! goes exclusively through the shared [`Vfs`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use rhai::{Array, Dynamic, Engine, EvalAltResult, Scope, INT};
use serde_json::Value;

use super::vfs::Vfs;
use super::{SandboxEngine, StateHandle};
use crate::models::task::ExecutionOutput;
use crate::{AppError, Result};

/// Extension names understood by [`RhaiEngine::load_extensions`].
pub const KNOWN_EXTENSIONS: &[&str] = &["fs", "time", "process"];

type ScriptResult<T> = std::result::Result<T, Box<EvalAltResult>>;

/// Rhai interpreter with a mount-table filesystem.
pub struct RhaiEngine {
    engine: Option<Engine>,
    states: HashMap<StateHandle, Scope<'static>>,
    next_handle: StateHandle,
    vfs: Rc<RefCell<Vfs>>,
    output: Rc<RefCell<String>>,
}

impl Default for RhaiEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RhaiEngine {
    /// Uninitialized engine with an empty filesystem view.
    #[must_use]
    pub fn new() -> Self {
        Self {
            engine: None,
            states: HashMap::new(),
            next_handle: 1,
            vfs: Rc::new(RefCell::new(Vfs::new())),
            output: Rc::new(RefCell::new(String::new())),
        }
    }

    /// Number of live global states.
    #[must_use]
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Current working directory of the filesystem view.
    #[must_use]
    pub fn cwd(&self) -> String {
        self.vfs.borrow().cwd().to_owned()
    }

    fn engine_mut(&mut self) -> Result<&mut Engine> {
        self.engine
            .as_mut()
            .ok_or_else(|| AppError::Internal("interpreter not initialized".into()))
    }

    fn register_fs(&mut self) -> Result<()> {
        let vfs = Rc::clone(&self.vfs);
        let engine = self.engine_mut()?;

        let view = Rc::clone(&vfs);
        engine.register_fn("read_file", move |path: &str| -> ScriptResult<String> {
            let bytes = view.borrow().read_file(path).map_err(script_error)?;
            String::from_utf8(bytes).map_err(|_| format!("{path} is not valid UTF-8").into())
        });

        let view = Rc::clone(&vfs);
        engine.register_fn(
            "write_file",
            move |path: &str, text: &str| -> ScriptResult<()> {
                view.borrow()
                    .write_file(path, text.as_bytes())
                    .map_err(script_error)
            },
        );

        let view = Rc::clone(&vfs);
        engine.register_fn("file_exists", move |path: &str| -> ScriptResult<bool> {
            view.borrow().exists(path).map_err(script_error)
        });

        let view = vfs;
        engine.register_fn("list_dir", move |path: &str| -> ScriptResult<Array> {
            let names = view.borrow().list_dir(path).map_err(script_error)?;
            Ok(names.into_iter().map(Dynamic::from).collect())
        });

        Ok(())
    }

    fn register_time(&mut self) -> Result<()> {
        let engine = self.engine_mut()?;
        engine.register_fn("sleep_ms", |millis: INT| {
            std::thread::sleep(Duration::from_millis(u64::try_from(millis).unwrap_or(0)));
        });
        engine.register_fn("timestamp_ms", || -> INT {
            chrono::Utc::now().timestamp_millis()
        });
        Ok(())
    }

    fn register_process(&mut self) -> Result<()> {
        let engine = self.engine_mut()?;
        engine.register_fn("process_exit", |code: INT| {
            std::process::exit(i32::try_from(code).unwrap_or(1));
        });
        Ok(())
    }
}

impl SandboxEngine for RhaiEngine {
    fn initialize(&mut self) -> Result<()> {
        let mut engine = Engine::new();

        let out = Rc::clone(&self.output);
        engine.on_print(move |text| {
            let mut buffer = out.borrow_mut();
            buffer.push_str(text);
            buffer.push('\n');
        });

        let out = Rc::clone(&self.output);
        engine.on_debug(move |text, _source, _pos| {
            let mut buffer = out.borrow_mut();
            buffer.push_str(text);
            buffer.push('\n');
        });

        self.engine = Some(engine);
        Ok(())
    }

    fn load_extensions(&mut self, names: &[String]) -> Result<()> {
        for name in names {
            match name.as_str() {
                "fs" => self.register_fs()?,
                "time" => self.register_time()?,
                "process" => self.register_process()?,
                other => {
                    return Err(AppError::Config(format!(
                        "unknown extension '{other}', expected one of {KNOWN_EXTENSIONS:?}"
                    )))
                }
            }
        }
        Ok(())
    }

    fn new_global_state(&mut self) -> Result<StateHandle> {
        if self.engine.is_none() {
            return Err(AppError::Internal("interpreter not initialized".into()));
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.states.insert(handle, Scope::new());
        Ok(handle)
    }

    fn destroy_global_state(&mut self, handle: StateHandle) {
        self.states.remove(&handle);
    }

    fn run(&mut self, code: &str, handle: StateHandle) -> Result<ExecutionOutput> {
        let engine = self
            .engine
            .as_ref()
            .ok_or_else(|| AppError::Internal("interpreter not initialized".into()))?;
        let scope = self
            .states
            .get_mut(&handle)
            .ok_or_else(|| AppError::NotFound(format!("interpreter state {handle}")))?;

        self.output.borrow_mut().clear();
        let outcome = engine.eval_with_scope::<Dynamic>(scope, code);
        let stdout = std::mem::take(&mut *self.output.borrow_mut());

        Ok(match outcome {
            Ok(value) => ExecutionOutput {
                result: to_json(&value),
                stdout,
                error: None,
            },
            Err(err) => ExecutionOutput {
                result: Value::Null,
                stdout,
                error: Some(err.to_string()),
            },
        })
    }

    fn mount(&mut self, virtual_path: &str, host_path: &Path) -> Result<()> {
        self.vfs.borrow_mut().mount(virtual_path, host_path)
    }

    fn unmount(&mut self, virtual_path: &str) -> Result<()> {
        self.vfs.borrow_mut().unmount(virtual_path)
    }

    fn chdir(&mut self, path: &str) -> Result<()> {
        self.vfs.borrow_mut().chdir(path)
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.vfs.borrow().read_file(path)
    }

    fn write_file(&mut self, path: &str, content: &[u8]) -> Result<()> {
        self.vfs.borrow().write_file(path, content)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        self.vfs.borrow().exists(path)
    }
}

/// Convert an interpreter value into JSON, falling back to its display form.
fn to_json(value: &Dynamic) -> Value {
    serde_json::to_value(value).unwrap_or_else(|_| Value::String(value.to_string()))
}

fn script_error(err: AppError) -> Box<EvalAltResult> {
    err.to_string().into()
}
