//! Process-level engine context shared by every script it creates.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::compiler::{
    CompilerService, ExternalCompiler, LinkRuntimeCallback, RuntimeLibraries, RuntimeSelector,
};
use crate::config::{ContextKind, EngineConfig};
use crate::launch::{Dispatcher, SerialDispatcher};
use crate::loader::{DlLoader, PlatformLoader};
use crate::objects::ObjectRuntime;

pub struct Driver {
    init_lock: Mutex<()>,
    loader: Arc<dyn PlatformLoader>,
    compiler: Option<Arc<dyn CompilerService>>,
    dispatcher: Arc<dyn Dispatcher>,
    objects: Arc<dyn ObjectRuntime>,
    config: EngineConfig,
    context: ContextKind,
    runtime_libraries: RuntimeLibraries,
    runtime_selector: Option<RuntimeSelector>,
    link_runtime: Option<LinkRuntimeCallback>,
}

impl Driver {
    pub fn builder(objects: Arc<dyn ObjectRuntime>) -> DriverBuilder {
        DriverBuilder {
            objects,
            loader: None,
            compiler: None,
            external_compiler: false,
            dispatcher: None,
            config: EngineConfig::default(),
            context: ContextKind::Normal,
            runtime_libraries: None,
            runtime_selector: None,
            link_runtime: None,
        }
    }

    /// Serializes script construction. Instancing state and the alias
    /// directory are only touched while this is held.
    pub(crate) fn lock_init(&self) -> MutexGuard<'_, ()> {
        self.init_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn loader(&self) -> &Arc<dyn PlatformLoader> {
        &self.loader
    }

    pub fn compiler(&self) -> Option<&Arc<dyn CompilerService>> {
        self.compiler.as_ref()
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    pub fn objects(&self) -> &Arc<dyn ObjectRuntime> {
        &self.objects
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn context(&self) -> ContextKind {
        self.context
    }

    pub fn runtime_libraries(&self) -> &RuntimeLibraries {
        &self.runtime_libraries
    }

    pub fn runtime_selector(&self) -> Option<&RuntimeSelector> {
        self.runtime_selector.as_ref()
    }

    pub fn link_runtime(&self) -> Option<&LinkRuntimeCallback> {
        self.link_runtime.as_ref()
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("config", &self.config)
            .field("context", &self.context)
            .field("compiler", &self.compiler.is_some())
            .field("runtime_libraries", &self.runtime_libraries)
            .finish_non_exhaustive()
    }
}

pub struct DriverBuilder {
    objects: Arc<dyn ObjectRuntime>,
    loader: Option<Arc<dyn PlatformLoader>>,
    compiler: Option<Arc<dyn CompilerService>>,
    external_compiler: bool,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    config: EngineConfig,
    context: ContextKind,
    runtime_libraries: Option<RuntimeLibraries>,
    runtime_selector: Option<RuntimeSelector>,
    link_runtime: Option<LinkRuntimeCallback>,
}

impl DriverBuilder {
    /// Defaults to [`DlLoader`].
    pub fn loader(mut self, loader: Arc<dyn PlatformLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn compiler(mut self, compiler: Arc<dyn CompilerService>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Uses [`ExternalCompiler`] with the executable named in the final
    /// config.
    pub fn external_compiler(mut self) -> Self {
        self.external_compiler = true;
        self
    }

    /// Defaults to [`SerialDispatcher`].
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn context(mut self, context: ContextKind) -> Self {
        self.context = context;
        self
    }

    /// Defaults to the libraries under the configured system directory.
    pub fn runtime_libraries(mut self, libs: RuntimeLibraries) -> Self {
        self.runtime_libraries = Some(libs);
        self
    }

    pub fn runtime_selector(mut self, selector: RuntimeSelector) -> Self {
        self.runtime_selector = Some(selector);
        self
    }

    pub fn link_runtime(mut self, callback: LinkRuntimeCallback) -> Self {
        self.link_runtime = Some(callback);
        self
    }

    pub fn build(self) -> Driver {
        let runtime_libraries = self
            .runtime_libraries
            .unwrap_or_else(|| RuntimeLibraries::under(&self.config.system_lib_dir));
        let compiler = match (self.compiler, self.external_compiler) {
            (Some(compiler), _) => Some(compiler),
            (None, true) => Some(Arc::new(ExternalCompiler::new(self.config.compiler.clone()))
                as Arc<dyn CompilerService>),
            (None, false) => None,
        };
        Driver {
            init_lock: Mutex::new(()),
            loader: self.loader.unwrap_or_else(|| Arc::new(DlLoader)),
            compiler,
            dispatcher: self
                .dispatcher
                .unwrap_or_else(|| Arc::new(SerialDispatcher)),
            objects: self.objects,
            config: self.config,
            context: self.context,
            runtime_libraries,
            runtime_selector: self.runtime_selector,
            link_runtime: self.link_runtime,
        }
    }
}
