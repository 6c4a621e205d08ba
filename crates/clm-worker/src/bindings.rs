//! Capability bindings: manifest → callable rhai functions.
//!
//! Every tool in the manifest becomes a function in a static module named
//! after its server (`files::Write(…)`). The designated built-in server's
//! tools are additionally registered under their plain names, first come
//! first served in manifest order; the system primitives are registered last
//! so `read_stdin`, `sleep`, `eprint`, `resolve_path` and `reset` always keep
//! their names.
//!
//! A capability accepts either a single map argument (taken as the argument
//! map) or positional arguments matched against the schema's declared order.
//! The alias table is applied before the required-field check, on the map
//! path only, since positional keys come from the schema itself.

use std::any::TypeId;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use rhai::serde::{from_dynamic, to_dynamic};
use rhai::{
    Dynamic, Engine, EvalAltResult, FnNamespace, FuncRegistration, Module, NativeCallContext,
    RhaiFunc, Shared,
};
use serde_json::{Map, Value};

use codeloom_core::aliases::{canonicalize, missing_required};
use codeloom_core::control::{OutputStream, WorkerEvent};
use codeloom_core::error::CapabilityError;
use codeloom_core::manifest::{AliasEntry, CapabilityManifest, ToolSpec};

use crate::WorkerShared;

/// Maximum positional arity registered per capability. Tools with more
/// declared parameters are still callable with a single map argument.
const MAX_TOOL_ARITY: usize = 8;

/// How long one `sleep` slice lasts between kill-flag checks.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Build the evaluation engine with the manifest's capabilities bound.
pub fn build_engine(manifest: &CapabilityManifest, shared: &Arc<WorkerShared>) -> Engine {
    let mut engine = Engine::new();

    // Cooperative kill: the progress hook fires between evaluation steps, so
    // a tight user loop terminates without any capability call.
    {
        let shared = Arc::clone(shared);
        engine.on_progress(move |_ops| {
            let id = shared.current.load(Ordering::Relaxed);
            if shared.kill.is_killed(id) {
                Some(Dynamic::from("submission killed"))
            } else {
                None
            }
        });
    }

    // Output capture: print → log, debug → warn.
    {
        let shared = Arc::clone(shared);
        engine.on_print(move |text| emit_lines(&shared, OutputStream::Log, text));
    }
    {
        let shared = Arc::clone(shared);
        engine.on_debug(move |text, _source, _pos| emit_lines(&shared, OutputStream::Warn, text));
    }

    // One static module per server, in manifest (declaration) order.
    for (server_name, server) in &manifest.servers {
        let mut module = Module::new();
        for (tool_name, spec) in &server.tools {
            register_tool_in_module(
                &mut module,
                server_name,
                tool_name,
                spec,
                &manifest.aliases,
                shared,
            );
        }
        engine.register_static_module(server_name, module.into());
    }

    // Plain names for the built-in server's tools.
    if let Some(builtin) = manifest.builtin.as_deref() {
        if let Some(server) = manifest.servers.get(builtin) {
            for (tool_name, spec) in &server.tools {
                register_tool_on_engine(
                    &mut engine,
                    builtin,
                    tool_name,
                    spec,
                    &manifest.aliases,
                    shared,
                );
            }
        }
    }

    register_primitives(&mut engine, shared);
    engine
}

/// Emit one `stream_output` event per line of `text`.
pub(crate) fn emit_lines(shared: &WorkerShared, stream: OutputStream, text: &str) {
    let submission_id = shared.current.load(Ordering::Relaxed);
    for line in text.split('\n') {
        let _ = shared.events.send(WorkerEvent::StreamOutput {
            submission_id,
            stream,
            text: line.to_string(),
        });
    }
}

fn register_tool_in_module(
    module: &mut Module,
    server: &str,
    tool: &str,
    spec: &ToolSpec,
    aliases: &[AliasEntry],
    shared: &Arc<WorkerShared>,
) {
    for arity in 0..=MAX_TOOL_ARITY {
        let server = server.to_string();
        let tool = tool.to_string();
        let spec = spec.clone();
        let aliases = aliases.to_vec();
        let shared = Arc::clone(shared);
        FuncRegistration::new(tool.clone())
            .with_namespace(FnNamespace::Internal)
            .set_into_module_raw(
                module,
                vec![TypeId::of::<Dynamic>(); arity],
                RhaiFunc::Method {
                    func: Shared::new(
                        move |_ctx: Option<NativeCallContext>, args: &mut [&mut Dynamic]| {
                            invoke_capability(&shared, &server, &tool, &spec, &aliases, args)
                        },
                    ),
                    has_context: true,
                    is_pure: true,
                    is_volatile: false,
                },
            );
    }
}

fn register_tool_on_engine(
    engine: &mut Engine,
    server: &str,
    tool: &str,
    spec: &ToolSpec,
    aliases: &[AliasEntry],
    shared: &Arc<WorkerShared>,
) {
    for arity in 0..=MAX_TOOL_ARITY {
        let server = server.to_string();
        let tool = tool.to_string();
        let spec = spec.clone();
        let aliases = aliases.to_vec();
        let shared = Arc::clone(shared);
        engine.register_raw_fn(
            tool.clone(),
            vec![TypeId::of::<Dynamic>(); arity],
            move |_ctx: NativeCallContext, args: &mut [&mut Dynamic]| {
                invoke_capability(&shared, &server, &tool, &spec, &aliases, args)
            },
        );
    }
}

/// Dispatch one capability invocation: assemble arguments, send the call,
/// block for the reply, convert it back into a script value.
fn invoke_capability(
    shared: &WorkerShared,
    server: &str,
    tool: &str,
    spec: &ToolSpec,
    aliases: &[AliasEntry],
    args: &mut [&mut Dynamic],
) -> Result<Dynamic, Box<EvalAltResult>> {
    let raw: Vec<Dynamic> = args.iter_mut().map(|a| std::mem::take(*a)).collect();
    let arguments =
        assemble_arguments(tool, spec, aliases, raw).map_err(|e| -> Box<EvalAltResult> {
            e.to_string().into()
        })?;

    let submission_id = shared.current.load(Ordering::Relaxed);
    let result = shared
        .bridge
        .call(&shared.kill, submission_id, server, tool, Value::Object(arguments))
        .map_err(|e| -> Box<EvalAltResult> { e.into() })?;
    to_dynamic(result)
}

/// Build the canonical argument map from a raw rhai argument list.
///
/// One map argument is taken as the argument map; anything else is matched
/// positionally against the declared parameter order. Aliasing runs before
/// the required-field check.
///
/// # Errors
///
/// Returns a [`CapabilityError`] for arity overflow, unconvertible values,
/// or a required parameter still missing after aliasing.
pub fn assemble_arguments(
    tool: &str,
    spec: &ToolSpec,
    aliases: &[AliasEntry],
    raw: Vec<Dynamic>,
) -> Result<Map<String, Value>, CapabilityError> {
    let mut map: Map<String, Value> = if raw.len() == 1 && raw[0].is_map() {
        let value: Value =
            from_dynamic(&raw[0]).map_err(|e| CapabilityError::InvalidArguments {
                tool: tool.to_string(),
                message: e.to_string(),
            })?;
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    } else {
        if raw.len() > spec.params.len() {
            return Err(CapabilityError::InvalidArguments {
                tool: tool.to_string(),
                message: format!(
                    "takes at most {} positional arguments, got {}",
                    spec.params.len(),
                    raw.len()
                ),
            });
        }
        let mut map = Map::new();
        for (param, value) in spec.params.iter().zip(raw) {
            let value: Value =
                from_dynamic(&value).map_err(|e| CapabilityError::InvalidArguments {
                    tool: tool.to_string(),
                    message: e.to_string(),
                })?;
            map.insert(param.name.clone(), value);
        }
        map
    };

    canonicalize(&mut map, &spec.params, aliases);
    if let Some(param) = missing_required(&map, &spec.params) {
        return Err(CapabilityError::MissingParameter {
            tool: tool.to_string(),
            param: param.to_string(),
        });
    }
    Ok(map)
}

fn register_primitives(engine: &mut Engine, shared: &Arc<WorkerShared>) {
    // read_stdin(): next chunk for the current submission.
    {
        let shared = Arc::clone(shared);
        engine.register_fn("read_stdin", move || -> Result<String, Box<EvalAltResult>> {
            let id = shared.current.load(Ordering::Relaxed);
            shared
                .stdin
                .pop_blocking(id, &shared.kill)
                .map_err(|e| -> Box<EvalAltResult> { e.into() })
        });
    }
    // read_stdin(id): explicit-id form.
    {
        let shared = Arc::clone(shared);
        engine.register_fn(
            "read_stdin",
            move |id: i64| -> Result<String, Box<EvalAltResult>> {
                shared
                    .stdin
                    .pop_blocking(id as u64, &shared.kill)
                    .map_err(|e| -> Box<EvalAltResult> { e.into() })
            },
        );
    }
    // sleep(seconds), kill-aware, f64 and integer forms.
    {
        let shared = Arc::clone(shared);
        engine.register_fn(
            "sleep",
            move |secs: f64| -> Result<(), Box<EvalAltResult>> { kill_aware_sleep(&shared, secs) },
        );
    }
    {
        let shared = Arc::clone(shared);
        engine.register_fn(
            "sleep",
            move |secs: i64| -> Result<(), Box<EvalAltResult>> {
                kill_aware_sleep(&shared, secs as f64)
            },
        );
    }
    // eprint(text) → err stream.
    {
        let shared = Arc::clone(shared);
        engine.register_fn("eprint", move |text: &str| {
            emit_lines(&shared, OutputStream::Err, text);
        });
    }
    // resolve_path(rel): absolute path against the submission's working
    // directory (the process cwd, switched per execute).
    engine.register_fn("resolve_path", |path: &str| -> String {
        let p = Path::new(path);
        if p.is_absolute() {
            return path.to_string();
        }
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(p).display().to_string(),
            Err(_) => path.to_string(),
        }
    });
    // reset(): clear persistent variables once this submission completes.
    {
        let shared = Arc::clone(shared);
        engine.register_fn("reset", move || {
            shared.reset_requested.store(true, Ordering::Relaxed);
        });
    }
}

fn kill_aware_sleep(shared: &WorkerShared, secs: f64) -> Result<(), Box<EvalAltResult>> {
    if secs <= 0.0 {
        return Ok(());
    }
    let id = shared.current.load(Ordering::Relaxed);
    let deadline = Instant::now() + Duration::from_secs_f64(secs);
    while Instant::now() < deadline {
        if shared.kill.is_killed(id) {
            return Err("submission killed".into());
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        std::thread::sleep(remaining.min(SLEEP_SLICE));
    }
    Ok(())
}
