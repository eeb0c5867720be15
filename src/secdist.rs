// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Secure credentials storage.
//!
//! A JSON document is read from a file and/or an environment variable;
//! object-valued fields merge recursively and non-object duplicates are
//! overridden by the environment copy. Consumer types register a parser once
//! per process and receive a stable integer index; a parsed document is a
//! vector of type-erased entries indexed by it.
//!
//! The [`Secdist`] component keeps the boot-time snapshot, a fresh snapshot
//! behind an [`Rcu`], and broadcasts updates over an event channel.

use crate::components::{Component, ComponentContext, ComponentFactory};
use crate::config::ComponentConfig;
use crate::error::Error;
use crate::exec::{TaskProcessor, blocking_bridge};
use crate::sync::event::{AsyncEventChannel, SubscriberScope};
use crate::sync::rcu::Rcu;
use crate::task::JoinHandle;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::any::{Any, TypeId, type_name};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// A credentials block parsed out of the secdist document.
pub trait SecdistEntry: Sized + Send + Sync + 'static {
    fn from_doc(doc: &serde_json::Value) -> Result<Self, Error>;
}

type ParseFn = fn(&serde_json::Value) -> Result<Box<dyn Any + Send + Sync>, Error>;

struct Module {
    type_id: TypeId,
    type_name: &'static str,
    parse: ParseFn,
}

static MODULES: Lazy<Mutex<Vec<Module>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Register `T` as a secdist consumer, returning its stable index.
/// Idempotent per type.
pub fn register<T: SecdistEntry>() -> usize {
    fn parse_erased<T: SecdistEntry>(
        doc: &serde_json::Value,
    ) -> Result<Box<dyn Any + Send + Sync>, Error> {
        Ok(Box::new(T::from_doc(doc)?))
    }

    let mut modules = MODULES.lock();
    if let Some(index) = modules
        .iter()
        .position(|module| module.type_id == TypeId::of::<T>())
    {
        return index;
    }
    modules.push(Module {
        type_id: TypeId::of::<T>(),
        type_name: type_name::<T>(),
        parse: parse_erased::<T>,
    });
    modules.len() - 1
}

#[derive(Clone, Default)]
pub struct SecdistSettings {
    pub config_path: Option<PathBuf>,
    /// Tolerate an absent file.
    pub missing_ok: bool,
    /// Environment variable holding a JSON document to merge over the file.
    pub environment_secrets_key: Option<String>,
    pub update_period: Option<Duration>,
    pub blocking_processor: Option<TaskProcessor>,
}

/// One parsed snapshot of the secdist document.
pub struct SecdistConfig {
    entries: Vec<Box<dyn Any + Send + Sync>>,
}

impl SecdistConfig {
    pub fn load(settings: &SecdistSettings) -> Result<Self, Error> {
        let doc = load_document(settings)?;
        Self::from_doc(&doc)
    }

    pub fn from_doc(doc: &serde_json::Value) -> Result<Self, Error> {
        let modules = MODULES.lock();
        let mut entries = Vec::with_capacity(modules.len());
        for module in modules.iter() {
            let entry = (module.parse)(doc).map_err(|err| {
                tracing::error!(module = module.type_name, "secdist parse failed: {err}");
                err
            })?;
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    /// The registered entry of type `T`, parsed from this snapshot.
    pub fn get<T: SecdistEntry>(&self) -> Result<&T, Error> {
        let index = {
            let modules = MODULES.lock();
            modules
                .iter()
                .position(|module| module.type_id == TypeId::of::<T>())
                .ok_or(Error::Invariant("secdist type was never registered"))?
        };
        self.entries
            .get(index)
            .and_then(|entry| entry.downcast_ref::<T>())
            .ok_or(Error::Invariant(
                "secdist entry registered after this snapshot was parsed",
            ))
    }
}

impl std::fmt::Debug for SecdistConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print credential contents
        f.debug_struct("SecdistConfig")
            .field("entries", &self.entries.len())
            .finish()
    }
}

fn load_document(settings: &SecdistSettings) -> Result<serde_json::Value, Error> {
    let file_doc = match &settings.config_path {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).map_err(Error::user)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && settings.missing_ok => {
                serde_json::Value::Null
            }
            Err(err) => return Err(Error::NetworkFailure(err)),
        },
        None => serde_json::Value::Null,
    };

    let env_doc = match &settings.environment_secrets_key {
        Some(key) => match std::env::var(key) {
            Ok(text) => serde_json::from_str(&text).map_err(Error::user)?,
            Err(std::env::VarError::NotPresent) => serde_json::Value::Null,
            Err(err) => return Err(Error::user(err)),
        },
        None => serde_json::Value::Null,
    };

    Ok(merge(file_doc, env_doc))
}

/// Merge `overlay` over `base`: objects merge recursively, any other
/// duplicate is overridden by the overlay.
fn merge(base: serde_json::Value, overlay: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match (base, overlay) {
        (base, Value::Null) => base,
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

struct SecdistCore {
    settings: SecdistSettings,
    snapshot: Rcu<Arc<SecdistConfig>>,
    channel: AsyncEventChannel<Arc<SecdistConfig>>,
}

impl SecdistCore {
    /// Re-read the sources, commit the fresh snapshot, broadcast it.
    fn update(&self) -> Result<(), Error> {
        let fresh = Arc::new(SecdistConfig::load(&self.settings)?);
        self.snapshot.assign(Arc::clone(&fresh));
        self.channel.publish(&fresh);
        Ok(())
    }
}

/// Client component for secure credentials and their updates.
pub struct Secdist {
    core: Arc<SecdistCore>,
    boot: Arc<SecdistConfig>,
    updater: Mutex<Option<JoinHandle<()>>>,
}

impl Secdist {
    pub fn new(settings: SecdistSettings) -> Result<Self, Error> {
        let boot = Arc::new(SecdistConfig::load(&settings)?);
        let core = Arc::new(SecdistCore {
            settings,
            snapshot: Rcu::new(Arc::clone(&boot)),
            channel: AsyncEventChannel::new("secdist"),
        });
        Ok(Self {
            core,
            boot,
            updater: Mutex::new(None),
        })
    }

    /// The snapshot loaded at service start; never changes.
    pub fn get(&self) -> &SecdistConfig {
        &self.boot
    }

    /// The freshest snapshot (from the last update).
    pub fn snapshot(&self) -> Arc<SecdistConfig> {
        self.core.snapshot.read_copy()
    }

    pub fn is_periodic_update_enabled(&self) -> bool {
        self.core.settings.update_period.is_some()
    }

    /// Re-read the sources now and broadcast the result.
    pub fn update(&self) -> Result<(), Error> {
        self.core.update()
    }

    /// Subscribe to secdist updates; the callback observes the current
    /// snapshot synchronously and then every update, with no gap.
    pub fn update_and_listen(
        &self,
        name: impl Into<String>,
        processor: &TaskProcessor,
        callback: impl Fn(&Arc<SecdistConfig>) + Send + Sync + 'static,
    ) -> Result<SubscriberScope<Arc<SecdistConfig>>, Error> {
        if !self.is_periodic_update_enabled() {
            return Err(Error::Invariant(
                "secdist updates must be enabled to subscribe to them",
            ));
        }
        let core = Arc::clone(&self.core);
        Ok(self
            .core
            .channel
            .update_and_listen(name, processor, callback, move |callback| {
                callback(&core.snapshot.read_copy());
            }))
    }

    /// Spawn the periodic updater onto `processor`. File reads go through
    /// the configured blocking processor when there is one.
    pub fn start_periodic_updates(&self, processor: &TaskProcessor) -> Result<(), Error> {
        let Some(period) = self.core.settings.update_period else {
            return Ok(());
        };
        let core = Arc::clone(&self.core);
        let reactor = processor.reactor().clone();

        let handle = processor.spawn(async move {
            loop {
                if reactor.sleep(period).await.is_err() {
                    return;
                }
                let result = match &core.settings.blocking_processor {
                    Some(blocking) => {
                        let settings = core.settings.clone();
                        match blocking_bridge(blocking, move || SecdistConfig::load(&settings))
                            .await
                        {
                            Ok(loaded) => loaded.map(|config| {
                                let fresh = Arc::new(config);
                                core.snapshot.assign(Arc::clone(&fresh));
                                core.channel.publish(&fresh);
                            }),
                            Err(err) => Err(err),
                        }
                    }
                    None => core.update(),
                };
                if let Err(err) = result {
                    if err.is_cancellation() {
                        return;
                    }
                    tracing::error!("secdist update failed: {err}");
                }
            }
        })?;

        *self.updater.lock() = Some(handle);
        Ok(())
    }
}

impl Component for Secdist {
    fn on_all_components_are_stopping(&self) {
        // dropping the handle cancels the periodic updater
        *self.updater.lock() = None;
    }
}

impl ComponentFactory for Secdist {
    const NAME: &'static str = "secdist";

    fn new(config: &ComponentConfig, context: &ComponentContext) -> Result<Self, Error> {
        let blocking_processor = config
            .get_opt::<String>("blocking_task_processor")?
            .map(|name| context.task_processor(&name).cloned())
            .transpose()?;

        let settings = SecdistSettings {
            config_path: config.get_opt("config_path")?,
            missing_ok: config.get_opt("missing_ok")?.unwrap_or(false),
            environment_secrets_key: config.get_opt("environment_secrets_key")?,
            update_period: config
                .get_opt::<u64>("update_period_ms")?
                .map(Duration::from_millis),
            blocking_processor,
        };

        let secdist = Self::new(settings)?;
        secdist.start_periodic_updates(context.default_task_processor())?;
        Ok(secdist)
    }
}

impl std::fmt::Debug for Secdist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secdist")
            .field("periodic", &self.is_periodic_update_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::fixture;
    use serde_json::json;

    #[test]
    fn overlay_merges_objects_and_overrides_scalars() {
        let file = json!({
            "user-passwords": { "alice": "file-pw", "bob": "bob-pw" },
            "token": "file-token",
            "kept": 1,
        });
        let env = json!({
            "user-passwords": { "alice": "env-pw", "carol": "carol-pw" },
            "token": "env-token",
        });

        let merged = merge(file, env);
        assert_eq!(
            merged,
            json!({
                "user-passwords": {
                    "alice": "env-pw",
                    "bob": "bob-pw",
                    "carol": "carol-pw",
                },
                "token": "env-token",
                "kept": 1,
            })
        );
    }

    #[derive(Debug, PartialEq)]
    struct UserPasswords {
        alice: String,
    }

    impl SecdistEntry for UserPasswords {
        fn from_doc(doc: &serde_json::Value) -> Result<Self, Error> {
            let alice = doc
                .pointer("/user-passwords/alice")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_owned();
            Ok(Self { alice })
        }
    }

    #[test]
    fn registered_types_parse_out_of_the_document() {
        register::<UserPasswords>();
        // registration is idempotent
        let index = register::<UserPasswords>();
        assert_eq!(register::<UserPasswords>(), index);

        let config =
            SecdistConfig::from_doc(&json!({ "user-passwords": { "alice": "s3cret" } })).unwrap();
        assert_eq!(config.get::<UserPasswords>().unwrap().alice, "s3cret");
    }

    #[test]
    fn file_and_environment_sources_merge() {
        register::<UserPasswords>();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secdist.json");
        std::fs::write(&path, r#"{"user-passwords":{"alice":"from-file"}}"#).unwrap();

        let var = "PLINTH_TEST_SECDIST_MERGE";
        // Safety: the variable name is unique to this test, so no other
        // thread reads or writes it concurrently.
        unsafe {
            std::env::set_var(var, r#"{"user-passwords":{"alice":"from-env"}}"#);
        }

        let settings = SecdistSettings {
            config_path: Some(path),
            environment_secrets_key: Some(var.to_owned()),
            ..SecdistSettings::default()
        };
        let config = SecdistConfig::load(&settings).unwrap();
        assert_eq!(config.get::<UserPasswords>().unwrap().alice, "from-env");
    }

    #[test]
    fn missing_file_is_tolerated_when_configured() {
        let settings = SecdistSettings {
            config_path: Some(PathBuf::from("/definitely/not/here.json")),
            missing_ok: true,
            ..SecdistSettings::default()
        };
        SecdistConfig::load(&settings).unwrap();

        let strict = SecdistSettings {
            config_path: Some(PathBuf::from("/definitely/not/here.json")),
            missing_ok: false,
            ..SecdistSettings::default()
        };
        assert!(SecdistConfig::load(&strict).is_err());
    }

    #[test]
    fn updates_reach_listeners_without_a_gap() {
        register::<UserPasswords>();
        let rt = fixture();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secdist.json");
        std::fs::write(&path, r#"{"user-passwords":{"alice":"v1"}}"#).unwrap();

        let secdist = Secdist::new(SecdistSettings {
            config_path: Some(path.clone()),
            update_period: Some(Duration::from_secs(3600)),
            ..SecdistSettings::default()
        })
        .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let _scope = secdist
            .update_and_listen("listener", &rt.processor, move |snapshot| {
                seen2
                    .lock()
                    .push(snapshot.get::<UserPasswords>().unwrap().alice.clone());
            })
            .unwrap();

        // initial snapshot observed synchronously
        assert_eq!(*seen.lock(), vec!["v1".to_owned()]);

        std::fs::write(&path, r#"{"user-passwords":{"alice":"v2"}}"#).unwrap();
        secdist.update().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while seen.lock().len() < 2 {
            assert!(std::time::Instant::now() < deadline, "update never delivered");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(*seen.lock(), vec!["v1".to_owned(), "v2".to_owned()]);

        assert_eq!(secdist.get().get::<UserPasswords>().unwrap().alice, "v1");
        assert_eq!(
            secdist.snapshot().get::<UserPasswords>().unwrap().alice,
            "v2"
        );
    }
}
