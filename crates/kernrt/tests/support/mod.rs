#![allow(dead_code)]

use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use kernrt::{
    Allocation, Dispatcher, Driver, DriverBuilder, EngineConfig, LaunchBounds, LaunchDescriptor,
    LaunchRange, ModuleHandle, ObjectRuntime, PlatformLoader, Script, ScriptIdentity,
    ScriptSource, SerialDispatcher, SymbolAddr,
};
use kernrt_contracts::SYMBOL_INFO;

/// Self-description text in the order modules embed it.
pub fn info_text(vars: &[&str], funcs: &[&str], foreach: &[(u32, &str)], objects: &[u32]) -> String {
    let mut out = format!("exportVarCount: {}\n", vars.len());
    for v in vars {
        out.push_str(&format!("{v}\n"));
    }
    out.push_str(&format!("exportFuncCount: {}\n", funcs.len()));
    for f in funcs {
        out.push_str(&format!("{f}\n"));
    }
    out.push_str(&format!("exportForEachCount: {}\n", foreach.len()));
    for (sig, name) in foreach {
        out.push_str(&format!("{sig} - {name}\n"));
    }
    out.push_str(&format!("objectSlotCount: {}\n", objects.len()));
    for o in objects {
        out.push_str(&format!("{o}\n"));
    }
    out
}

/// Template for the image a file on disk "contains".
#[derive(Debug, Clone, Default)]
pub struct FakeImage {
    pub info: Option<String>,
    pub code: Vec<(String, usize)>,
    /// Name and size in bytes.
    pub globals: Vec<(String, usize)>,
}

impl FakeImage {
    pub fn new(info: &str) -> Self {
        Self {
            info: Some(info.to_string()),
            ..Self::default()
        }
    }

    pub fn without_info() -> Self {
        Self::default()
    }

    pub fn code(mut self, name: &str, addr: usize) -> Self {
        self.code.push((name.to_string(), addr));
        self
    }

    pub fn global(mut self, name: &str, bytes: usize) -> Self {
        self.globals.push((name.to_string(), bytes));
        self
    }
}

struct Instance {
    image: Arc<FakeImage>,
    opened_as: PathBuf,
    refs: usize,
    info: Option<CString>,
    storage: HashMap<String, Box<[AtomicU64]>>,
}

#[derive(Default)]
struct LoaderState {
    by_path: HashMap<PathBuf, usize>,
    instances: HashMap<usize, Instance>,
    next: usize,
    opens: Vec<PathBuf>,
    closes: usize,
}

/// In-memory platform loader. Opening the same path again returns the same
/// instance and globals; a different path (even a symlink to the same file)
/// gets a fresh instance with zeroed globals.
#[derive(Default)]
pub struct FakeLoader {
    templates: Mutex<HashMap<PathBuf, Arc<FakeImage>>>,
    state: Mutex<LoaderState>,
}

impl FakeLoader {
    /// Writes a placeholder file at `path` and registers what it contains.
    pub fn install(&self, path: &Path, image: FakeImage) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"\x7fELF").unwrap();
        let canonical = path.canonicalize().unwrap();
        self.templates
            .lock()
            .unwrap()
            .insert(canonical, Arc::new(image));
    }

    pub fn opens(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().opens.clone()
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    pub fn live(&self) -> usize {
        self.state.lock().unwrap().instances.len()
    }

    pub fn opened_as(&self, handle: ModuleHandle) -> Option<PathBuf> {
        let st = self.state.lock().unwrap();
        st.instances.get(&handle.0).map(|i| i.opened_as.clone())
    }
}

impl PlatformLoader for FakeLoader {
    fn open(&self, path: &Path) -> Result<ModuleHandle, String> {
        let canonical = path
            .canonicalize()
            .map_err(|e| format!("{}: {e}", path.display()))?;
        let image = self
            .templates
            .lock()
            .unwrap()
            .get(&canonical)
            .cloned()
            .ok_or_else(|| format!("{}: invalid ELF header", path.display()))?;

        let mut st = self.state.lock().unwrap();
        st.opens.push(path.to_path_buf());
        if let Some(&h) = st.by_path.get(path) {
            st.instances.get_mut(&h).unwrap().refs += 1;
            return Ok(ModuleHandle(h));
        }
        st.next += 1;
        let h = st.next;
        let storage = image
            .globals
            .iter()
            .map(|(name, bytes)| {
                let words = bytes.div_ceil(8).max(1);
                let cells: Box<[AtomicU64]> = (0..words).map(|_| AtomicU64::new(0)).collect();
                (name.clone(), cells)
            })
            .collect();
        let info = image
            .info
            .as_ref()
            .map(|text| CString::new(text.as_str()).unwrap());
        st.instances.insert(
            h,
            Instance {
                image,
                opened_as: path.to_path_buf(),
                refs: 1,
                info,
                storage,
            },
        );
        st.by_path.insert(path.to_path_buf(), h);
        Ok(ModuleHandle(h))
    }

    fn resolve(&self, handle: ModuleHandle, name: &str) -> Option<SymbolAddr> {
        let st = self.state.lock().unwrap();
        let inst = st.instances.get(&handle.0)?;
        if name == SYMBOL_INFO {
            return SymbolAddr::new(inst.info.as_ref()?.as_ptr() as *mut c_void);
        }
        if let Some((_, addr)) = inst.image.code.iter().find(|(n, _)| n == name) {
            return SymbolAddr::new(*addr as *mut c_void);
        }
        let cells = inst.storage.get(name)?;
        SymbolAddr::new(cells.as_ptr() as *mut c_void)
    }

    fn close(&self, handle: ModuleHandle) {
        let mut st = self.state.lock().unwrap();
        st.closes += 1;
        let inst = st.instances.get_mut(&handle.0).expect("close of unknown handle");
        inst.refs -= 1;
        if inst.refs == 0 {
            let inst = st.instances.remove(&handle.0).unwrap();
            st.by_path.remove(&inst.opened_as);
        }
    }

    fn resolve_error(&self, name: &str) -> String {
        format!("undefined symbol: {name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefEvent {
    Inc(usize),
    Dec(usize),
}

/// Object runtime that records every transition and tracks counts.
#[derive(Default)]
pub struct RecordingObjects {
    events: Mutex<Vec<RefEvent>>,
    counts: Mutex<HashMap<usize, i64>>,
    min_seen: Mutex<HashMap<usize, i64>>,
}

impl RecordingObjects {
    pub fn hold(&self, obj: usize, count: i64) {
        self.counts.lock().unwrap().insert(obj, count);
        self.min_seen.lock().unwrap().insert(obj, count);
    }

    pub fn count(&self, obj: usize) -> i64 {
        *self.counts.lock().unwrap().get(&obj).unwrap_or(&0)
    }

    /// Lowest count `obj` ever reached.
    pub fn min_seen(&self, obj: usize) -> i64 {
        *self.min_seen.lock().unwrap().get(&obj).unwrap_or(&0)
    }

    pub fn events(&self) -> Vec<RefEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn decs(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, RefEvent::Dec(_)))
            .count()
    }

    fn bump(&self, obj: usize, delta: i64) {
        let mut counts = self.counts.lock().unwrap();
        let c = counts.entry(obj).or_insert(0);
        *c += delta;
        let mut min = self.min_seen.lock().unwrap();
        let m = min.entry(obj).or_insert(*c);
        *m = (*m).min(*c);
    }
}

impl ObjectRuntime for RecordingObjects {
    fn inc_ref(&self, obj: NonNull<c_void>) {
        let key = obj.as_ptr() as usize;
        self.bump(key, 1);
        self.events.lock().unwrap().push(RefEvent::Inc(key));
    }

    fn dec_ref(&self, obj: NonNull<c_void>) {
        let key = obj.as_ptr() as usize;
        self.bump(key, -1);
        self.events.lock().unwrap().push(RefEvent::Dec(key));
    }
}

pub fn obj(addr: usize) -> Option<NonNull<c_void>> {
    NonNull::new(addr as *mut c_void)
}

/// What a dispatcher saw for one launch.
#[derive(Debug, Clone, Copy)]
pub struct SeenLaunch {
    pub bounds: LaunchBounds,
    pub slot: u32,
    pub is_threadable: bool,
    pub slice_size: u32,
    pub has_range: bool,
}

/// Serial dispatcher that records each launch first.
#[derive(Default)]
pub struct CountingDispatcher {
    calls: AtomicUsize,
    seen: Mutex<Vec<SeenLaunch>>,
}

impl CountingDispatcher {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<SeenLaunch> {
        self.seen.lock().unwrap().clone()
    }
}

impl Dispatcher for CountingDispatcher {
    fn dispatch(
        &self,
        input: Option<&dyn Allocation>,
        output: Option<&dyn Allocation>,
        range: Option<&LaunchRange>,
        launch: &LaunchDescriptor<'_>,
    ) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(SeenLaunch {
            bounds: launch.bounds,
            slot: launch.params.slot,
            is_threadable: launch.is_threadable,
            slice_size: launch.slice_size,
            has_range: range.is_some(),
        });
        SerialDispatcher.dispatch(input, output, range, launch);
    }
}

/// One isolated engine: its own temp tree, loader, object runtime and
/// dispatcher.
pub struct Harness {
    pub tmp: tempfile::TempDir,
    pub loader: Arc<FakeLoader>,
    pub objects: Arc<RecordingObjects>,
    pub dispatcher: Arc<CountingDispatcher>,
    pub driver: Driver,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|b| b)
    }

    pub fn with(customize: impl FnOnce(DriverBuilder) -> DriverBuilder) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("app/cache")).unwrap();
        let loader = Arc::new(FakeLoader::default());
        let objects = Arc::new(RecordingObjects::default());
        let dispatcher = Arc::new(CountingDispatcher::default());
        let config = EngineConfig {
            system_lib_dir: tmp.path().join("system/lib"),
            ..EngineConfig::default()
        };
        let builder = Driver::builder(objects.clone())
            .loader(loader.clone())
            .dispatcher(dispatcher.clone())
            .config(config);
        let driver = customize(builder).build();
        Self {
            tmp,
            loader,
            objects,
            dispatcher,
            driver,
        }
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.tmp.path().join("app/cache")
    }

    pub fn identity(&self, res: &str) -> ScriptIdentity {
        ScriptIdentity::new(self.cache_dir(), res)
    }

    pub fn app_library(&self, res: &str) -> PathBuf {
        self.tmp.path().join(format!("app/lib/librs.{res}.so"))
    }

    pub fn system_library(&self, res: &str) -> PathBuf {
        self.tmp.path().join(format!("system/lib/librs.{res}.so"))
    }

    pub fn install_app(&self, res: &str, image: FakeImage) -> PathBuf {
        let path = self.app_library(res);
        self.loader.install(&path, image);
        path
    }

    pub fn install_system(&self, res: &str, image: FakeImage) -> PathBuf {
        let path = self.system_library(res);
        self.loader.install(&path, image);
        path
    }

    /// Loads and initializes a prebuilt script.
    pub fn create(&self, res: &str) -> kernrt::Result<Script> {
        // SAFETY: fake images only export functions defined by the tests
        // with the signatures their roles require.
        unsafe { Script::create(&self.driver, self.identity(res), ScriptSource::Prebuilt) }
    }

    pub fn load(&self, res: &str) -> kernrt::Result<Script> {
        // SAFETY: see `create`.
        unsafe { Script::load(&self.driver, self.identity(res), ScriptSource::Prebuilt) }
    }
}
