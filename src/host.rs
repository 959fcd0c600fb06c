//! Scripting-host binding.
//!
//! Load-testing hosts discover extensions through a registry of module
//! identifiers. This module provides that registry, the beanstalkd module
//! registered under [`MODULE_ID`], and [`ScriptClient`], the blocking object
//! scripts receive from `newClient(address)`.
//!
//! Values cross the boundary as JSON. Durations are seconds (fractions
//! allowed) and job bodies are strings.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::runtime::Runtime;

use crate::client::Client;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::job::DEFAULT_PRIORITY;

/// Identifier the beanstalkd module is registered under.
pub const MODULE_ID: &str = "k6/x/beanstalkd";

/// Export that constructs a [`ScriptClient`].
pub const NEW_CLIENT: &str = "newClient";

const DEFAULT_TTR: Duration = Duration::from_secs(60);

/// An object handed to scripts.
pub trait HostObject: Send + std::fmt::Debug {
    /// Invoke a script-visible method.
    fn call(&mut self, method: &str, args: &[Value]) -> Result<Value>;
}

/// A module the host can load by identifier.
pub trait HostModule: Send + Sync {
    /// Names of the constructors this module exports.
    fn exports(&self) -> &'static [&'static str];

    /// Run the constructor `export` with script arguments.
    fn construct(&self, export: &str, args: &[Value]) -> Result<Box<dyn HostObject>>;
}

/// Modules keyed by identifier.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn HostModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `module` under `id`. Identifiers are claimed once.
    pub fn register(&mut self, id: impl Into<String>, module: Arc<dyn HostModule>) -> Result<()> {
        let id = id.into();
        if self.modules.contains_key(&id) {
            return Err(Error::Host(format!("module {id} is already registered")));
        }
        tracing::debug!(module = %id, "Registered host module");
        self.modules.insert(id, module);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn HostModule>> {
        self.modules.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.modules.contains_key(id)
    }

    /// Registered identifiers, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Look up `id` and run its constructor `export`.
    pub fn construct(&self, id: &str, export: &str, args: &[Value]) -> Result<Box<dyn HostObject>> {
        let module = self
            .get(id)
            .ok_or_else(|| Error::Host(format!("module {id} is not registered")))?;
        module.construct(export, args)
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.ids())
            .finish()
    }
}

static GLOBAL_REGISTRY: LazyLock<RwLock<ModuleRegistry>> =
    LazyLock::new(|| RwLock::new(ModuleRegistry::new()));

/// The process-wide registry hosts load modules from.
pub fn global_registry() -> &'static RwLock<ModuleRegistry> {
    &GLOBAL_REGISTRY
}

/// Register [`Beanstalkd`] in the global registry under [`MODULE_ID`].
pub fn register_default() -> Result<()> {
    global_registry()
        .write()
        .map_err(|_| Error::Host("module registry lock poisoned".to_string()))?
        .register(MODULE_ID, Arc::new(Beanstalkd))
}

/// The beanstalkd host module.
#[derive(Debug, Clone, Copy, Default)]
pub struct Beanstalkd;

impl HostModule for Beanstalkd {
    fn exports(&self) -> &'static [&'static str] {
        &[NEW_CLIENT]
    }

    /// `newClient(address, options?)`
    ///
    /// `options` may override any [`ClientConfig`] field except the address.
    fn construct(&self, export: &str, args: &[Value]) -> Result<Box<dyn HostObject>> {
        if export != NEW_CLIENT {
            return Err(Error::Host(format!("{MODULE_ID} has no export {export}")));
        }
        let config = client_config(args)?;
        Ok(Box::new(ScriptClient::connect(config)?))
    }
}

fn client_config(args: &[Value]) -> Result<ClientConfig> {
    let addr = arg_str(args, 0, NEW_CLIENT)?;
    let mut config = match args.get(1) {
        None | Some(Value::Null) => ClientConfig::default(),
        Some(options) => serde_json::from_value(options.clone())
            .map_err(|e| Error::Host(format!("{NEW_CLIENT}: invalid options: {e}")))?,
    };
    config.addr = addr.to_string();
    Ok(config)
}

/// A client whose every call blocks until the server replies.
#[derive(Debug)]
pub struct ScriptClient {
    runtime: Runtime,
    client: Client,
}

impl ScriptClient {
    /// Connect on a private current-thread runtime.
    ///
    /// Must not be called from within an async context.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|e| Error::Host(format!("failed to start runtime: {e}")))?;
        let client = runtime.block_on(Client::new(config))?;
        Ok(Self { runtime, client })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl HostObject for ScriptClient {
    fn call(&mut self, method: &str, args: &[Value]) -> Result<Value> {
        let Self { runtime, client } = self;
        match method {
            "use" => {
                client.use_tube(arg_str(args, 0, method)?)?;
                Ok(Value::Null)
            }
            "watch" => Ok(Value::Bool(client.watch(arg_str(args, 0, method)?)?)),
            "ignore" => {
                client.ignore(arg_str(args, 0, method)?)?;
                Ok(Value::Null)
            }
            "put" => {
                let body = arg_str(args, 0, method)?;
                let priority = opt_priority(args, 1, method)?;
                let delay = opt_secs(args, 2, method)?.unwrap_or(Duration::ZERO);
                let ttr = opt_secs(args, 3, method)?.unwrap_or(DEFAULT_TTR);
                let id = runtime.block_on(client.put(body.as_bytes(), priority, delay, ttr))?;
                Ok(json!(id.0))
            }
            "reserve" => {
                let timeout = opt_secs(args, 0, method)?;
                let job = runtime.block_on(client.reserve(timeout))?;
                Ok(json!([job.id.0, job.body_lossy()]))
            }
            "delete" => {
                let id = arg_u64(args, 0, method)?;
                runtime.block_on(client.delete(id))?;
                Ok(Value::Null)
            }
            "release" => {
                let id = arg_u64(args, 0, method)?;
                let priority = opt_priority(args, 1, method)?;
                let delay = opt_secs(args, 2, method)?.unwrap_or(Duration::ZERO);
                runtime.block_on(client.release(id, priority, delay))?;
                Ok(Value::Null)
            }
            "bury" => {
                let id = arg_u64(args, 0, method)?;
                let priority = opt_priority(args, 1, method)?;
                runtime.block_on(client.bury(id, priority))?;
                Ok(Value::Null)
            }
            "touch" => {
                let id = arg_u64(args, 0, method)?;
                runtime.block_on(client.touch(id))?;
                Ok(Value::Null)
            }
            "kick" => {
                let bound = u32::try_from(arg_u64(args, 0, method)?)
                    .map_err(|_| Error::Host(format!("{method}: bound out of range")))?;
                Ok(json!(runtime.block_on(client.kick(bound))?))
            }
            "peek" => {
                let id = arg_u64(args, 0, method)?;
                let body = runtime.block_on(client.peek(id))?;
                Ok(Value::String(String::from_utf8_lossy(&body).into_owned()))
            }
            "stats" => Ok(stats_value(runtime.block_on(client.stats())?)),
            "statsTube" => {
                let tube = arg_str(args, 0, method)?;
                Ok(stats_value(runtime.block_on(client.stats_tube(tube))?))
            }
            "listTubes" => Ok(json!(runtime.block_on(client.list_tubes())?)),
            "close" => {
                runtime.block_on(client.close())?;
                Ok(Value::Null)
            }
            other => Err(Error::Host(format!("unknown method {other}"))),
        }
    }
}

fn stats_value(stats: crate::job::Stats) -> Value {
    Value::Object(
        stats
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect::<Map<String, Value>>(),
    )
}

fn arg_str<'a>(args: &'a [Value], idx: usize, method: &str) -> Result<&'a str> {
    args.get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Host(format!("{method}: argument {idx} must be a string")))
}

fn arg_u64(args: &[Value], idx: usize, method: &str) -> Result<u64> {
    args.get(idx)
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::Host(format!("{method}: argument {idx} must be a job id")))
}

fn opt_priority(args: &[Value], idx: usize, method: &str) -> Result<u32> {
    match args.get(idx) {
        None | Some(Value::Null) => Ok(DEFAULT_PRIORITY),
        Some(v) => v
            .as_u64()
            .and_then(|p| u32::try_from(p).ok())
            .ok_or_else(|| Error::Host(format!("{method}: priority must fit in 32 bits"))),
    }
}

fn opt_secs(args: &[Value], idx: usize, method: &str) -> Result<Option<Duration>> {
    match args.get(idx) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(|s| Some(Duration::from_secs_f64(s)))
            .ok_or_else(|| {
                Error::Host(format!("{method}: argument {idx} must be a non-negative number of seconds"))
            }),
    }
}
