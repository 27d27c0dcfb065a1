// Pipeline hot reloading
//
// Two background notify watchers and a debounce thread feed the main
// thread: source-file events only move a timestamp, compiled-binary
// events land in the write side of a double-buffered path set. The main
// thread drains the read side once per frame and rebuilds the affected
// pipelines. The buffer swap at the drain point is the only
// synchronization contract between the threads; the mutex around the
// set is held for single inserts and the swap, never across the
// boundary.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ash::vk;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;

use crate::backend::deletion::{DeferredResource, DeletionQueue};
use crate::backend::pipeline::PipelineDesc;
use crate::backend::sync::DoubleBuffered;
use crate::config::HotReloadConfig;

/// Extension of compiled shader binaries.
pub const SPIRV_EXT: &str = "spv";

/// Pending binary changes are deduplicated by path and capped; beyond
/// this, events are dropped with a warning rather than growing without
/// bound.
pub const MAX_PENDING_CHANGES: usize = 1024;

/// A recompile runs only after the sources have been quiet this long.
const QUIET_PERIOD: Duration = Duration::from_secs(1);

/// The debounce thread re-checks at most this often.
const POLL_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

/// One shader stage of a registered pipeline: where its source lives
/// and the SPIR-V it was last built from.
#[derive(Debug, Clone)]
pub struct StageBinary {
    pub stage: ShaderStage,
    pub source_path: PathBuf,
    pub spirv: Vec<u8>,
}

struct ReloadEntry {
    pipeline: vk::Pipeline,
    desc: PipelineDesc,
    stages: Vec<StageBinary>,
}

/// Registered pipelines and the logic matching changed binaries to
/// them. Separate from the watcher so it works without threads.
#[derive(Default)]
pub struct ReloadRegistry {
    entries: Vec<ReloadEntry>,
}

impl ReloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pipeline so changed binaries can rebuild it.
    pub fn register(&mut self, pipeline: vk::Pipeline, desc: PipelineDesc, stages: Vec<StageBinary>) {
        self.entries.push(ReloadEntry {
            pipeline,
            desc,
            stages,
        });
    }

    /// Forgets a pipeline. Does not destroy it.
    pub fn unregister(&mut self, pipeline: vk::Pipeline) {
        self.entries.retain(|entry| entry.pipeline != pipeline);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current handles of all registered pipelines.
    pub fn registered_pipelines(&self) -> impl Iterator<Item = vk::Pipeline> + '_ {
        self.entries.iter().map(|entry| entry.pipeline)
    }

    /// Loads the changed binaries, rebuilds every pipeline that uses
    /// one of them, and enqueues the replaced handles for deferred
    /// deletion. Returns how many pipelines were rebuilt. Any failure
    /// is logged and leaves the previous pipeline in place.
    pub fn apply_changes(
        &mut self,
        changed: impl IntoIterator<Item = PathBuf>,
        rebuild: &mut dyn FnMut(&PipelineDesc, &[StageBinary]) -> Result<vk::Pipeline>,
        deletion: &mut DeletionQueue,
    ) -> usize {
        let mut affected: Vec<usize> = Vec::new();

        for path in changed {
            let Some(source_name) = compiled_source_name(&path) else {
                continue;
            };
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("Could not read recompiled shader {:?}: {}", path, e);
                    continue;
                }
            };

            for (index, entry) in self.entries.iter_mut().enumerate() {
                for stage in &mut entry.stages {
                    if stage.source_path.file_name() == Some(source_name.as_os_str()) {
                        stage.spirv = bytes.clone();
                        if !affected.contains(&index) {
                            affected.push(index);
                        }
                        // One source cannot feed two stages of the same
                        // pipeline.
                        break;
                    }
                }
            }
        }

        let mut reloaded = 0;
        for index in affected {
            let entry = &mut self.entries[index];
            match rebuild(&entry.desc, &entry.stages) {
                Ok(new_pipeline) => {
                    deletion.enqueue(DeferredResource::Pipeline(entry.pipeline));
                    entry.pipeline = new_pipeline;
                    reloaded += 1;
                }
                Err(e) => {
                    log::error!("Pipeline rebuild failed, keeping previous: {:#}", e);
                }
            }
        }
        reloaded
    }
}

/// `foo.frag.spv` was compiled from `foo.frag`; anything else is not a
/// compiled shader binary.
fn compiled_source_name(path: &Path) -> Option<OsString> {
    if path.extension()? != SPIRV_EXT {
        return None;
    }
    Some(path.file_stem()?.to_os_string())
}

/// Time left before a due recompile may run, `None` when none is due.
/// `changed_ms`/`last_run_ms` are milliseconds since the watcher
/// started (0 = never).
fn recompile_wait(changed_ms: u64, last_run_ms: u64, now: Duration) -> Option<Duration> {
    if changed_ms == 0 || changed_ms <= last_run_ms {
        return None;
    }
    let deadline = Duration::from_millis(changed_ms) + QUIET_PERIOD;
    Some(deadline.saturating_sub(now))
}

/// State shared with the watcher callbacks and the debounce thread.
struct WatchShared {
    anchor: Instant,
    pending: Mutex<DoubleBuffered<HashSet<PathBuf>>>,
    last_source_change_ms: AtomicU64,
}

impl WatchShared {
    fn new() -> Self {
        Self {
            anchor: Instant::now(),
            pending: Mutex::new(DoubleBuffered::new(HashSet::new(), HashSet::new())),
            last_source_change_ms: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.anchor.elapsed().as_millis() as u64
    }

    fn note_source_change(&self) {
        self.last_source_change_ms
            .store(self.now_ms().max(1), Ordering::Relaxed);
    }

    fn note_binary_change(&self, path: PathBuf) {
        let mut pending = self.pending.lock();
        let write = pending.write_mut();
        if write.len() >= MAX_PENDING_CHANGES {
            log::warn!("Hot-reload change set full, dropping {:?}", path);
            return;
        }
        write.insert(path);
    }
}

/// Watches shader sources and compiled binaries, recompiles in the
/// background, and rebuilds registered pipelines at the per-frame
/// drain point.
pub struct PipelineHotReloader {
    shared: Arc<WatchShared>,
    registry: ReloadRegistry,
    stop: Arc<AtomicBool>,
    recompile_thread: Option<thread::JoinHandle<()>>,
    // Watchers stop on drop.
    _source_watcher: RecommendedWatcher,
    _binary_watcher: RecommendedWatcher,
}

impl PipelineHotReloader {
    pub fn new(config: &HotReloadConfig) -> Result<Self> {
        let shared = Arc::new(WatchShared::new());

        // Source watcher: broad filter, only moves the timestamp.
        let source_extensions: Vec<String> = config
            .source_extensions
            .iter()
            .map(|ext| ext.to_lowercase())
            .collect();
        let source_shared = shared.clone();
        let mut source_watcher =
            notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
                let Ok(event) = event else { return };
                if event.kind.is_access() {
                    return;
                }
                if event.paths.iter().any(|p| has_extension(p, &source_extensions)) {
                    source_shared.note_source_change();
                }
            })
            .context("Failed to create source watcher")?;
        source_watcher
            .watch(Path::new(&config.source_dir), RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch source dir {:?}", config.source_dir))?;

        // Binary watcher: narrow filter, collects paths for the drain.
        let binary_shared = shared.clone();
        let mut binary_watcher =
            notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
                let Ok(event) = event else { return };
                if event.kind.is_access() {
                    return;
                }
                for path in event.paths {
                    if path.extension().map_or(false, |ext| ext == SPIRV_EXT) {
                        binary_shared.note_binary_change(path);
                    }
                }
            })
            .context("Failed to create binary watcher")?;
        binary_watcher
            .watch(Path::new(&config.binary_dir), RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch binary dir {:?}", config.binary_dir))?;

        let stop = Arc::new(AtomicBool::new(false));
        let recompile_thread = Some(spawn_recompile_thread(
            shared.clone(),
            stop.clone(),
            config.recompile_command.clone(),
        ));

        log::info!(
            "Hot reload watching {:?} (sources) and {:?} (binaries)",
            config.source_dir,
            config.binary_dir
        );

        Ok(Self {
            shared,
            registry: ReloadRegistry::new(),
            stop,
            recompile_thread,
            _source_watcher: source_watcher,
            _binary_watcher: binary_watcher,
        })
    }

    pub fn register(&mut self, pipeline: vk::Pipeline, desc: PipelineDesc, stages: Vec<StageBinary>) {
        self.registry.register(pipeline, desc, stages);
    }

    pub fn unregister(&mut self, pipeline: vk::Pipeline) {
        self.registry.unregister(pipeline);
    }

    pub fn registry(&self) -> &ReloadRegistry {
        &self.registry
    }

    /// Swaps the double-buffered change set and rebuilds every pipeline
    /// affected by the drained paths. Called once per frame from the
    /// main thread; returns how many pipelines were rebuilt.
    pub fn drain_and_reload(
        &mut self,
        rebuild: &mut dyn FnMut(&PipelineDesc, &[StageBinary]) -> Result<vk::Pipeline>,
        deletion: &mut DeletionQueue,
    ) -> usize {
        let drained = {
            let mut pending = self.shared.pending.lock();
            pending.advance();
            std::mem::take(pending.read_mut())
        };
        if drained.is_empty() {
            return 0;
        }
        self.registry.apply_changes(drained, rebuild, deletion)
    }

    #[cfg(test)]
    fn inject_binary_change(&self, path: PathBuf) {
        self.shared.note_binary_change(path);
    }
}

impl Drop for PipelineHotReloader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.recompile_thread.take() {
            let _ = handle.join();
        }
    }
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| {
            let ext = ext.to_lowercase();
            extensions.iter().any(|known| *known == ext)
        })
}

fn spawn_recompile_thread(
    shared: Arc<WatchShared>,
    stop: Arc<AtomicBool>,
    command: Vec<String>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut last_run_ms: u64 = 0;
        while !stop.load(Ordering::Relaxed) {
            let changed_ms = shared.last_source_change_ms.load(Ordering::Relaxed);
            match recompile_wait(changed_ms, last_run_ms, shared.anchor.elapsed()) {
                // The sources have been quiet for the full period.
                Some(wait) if wait.is_zero() => {
                    last_run_ms = shared.now_ms().max(1);
                    run_recompile(&command);
                }
                // Still settling (a burst coalesces into one run), or
                // nothing new since the last run.
                _ => {}
            }
            thread::sleep(POLL_PERIOD);
        }
    })
}

fn run_recompile(command: &[String]) {
    let Some((program, args)) = command.split_first() else {
        log::debug!("No recompile command configured, skipping");
        return;
    };
    log::info!("Recompiling shaders: {}", command.join(" "));
    match std::process::Command::new(program).args(args).status() {
        Ok(status) if status.success() => {}
        Ok(status) => log::error!("Shader recompilation failed with {}", status),
        Err(e) => log::error!("Could not run shader recompilation: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "frameloop-{}-{}",
            tag,
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn stage(stage: ShaderStage, source: &str) -> StageBinary {
        StageBinary {
            stage,
            source_path: PathBuf::from(source),
            spirv: vec![0; 8],
        }
    }

    #[test]
    fn debounce_waits_for_quiet_period() {
        // Nothing changed yet.
        assert_eq!(recompile_wait(0, 0, Duration::from_millis(500)), None);

        // A change 100 ms in: run once the quiet second has passed.
        let wait = recompile_wait(100, 0, Duration::from_millis(500)).unwrap();
        assert_eq!(wait, Duration::from_millis(600));

        // Past the deadline the wait is zero, not negative.
        let wait = recompile_wait(100, 0, Duration::from_millis(2000)).unwrap();
        assert!(wait.is_zero());
    }

    #[test]
    fn debounce_runs_once_per_burst() {
        // Three rapid edits, last at 900 ms.
        let changed_ms = 900;
        assert!(recompile_wait(changed_ms, 0, Duration::from_millis(950)).is_some());

        // The run happened at 1900 ms; the whole burst is covered.
        let last_run_ms = 1900;
        assert_eq!(
            recompile_wait(changed_ms, last_run_ms, Duration::from_millis(2000)),
            None
        );
    }

    #[test]
    fn compiled_source_name_strips_spv() {
        assert_eq!(
            compiled_source_name(Path::new("/out/cube.frag.spv")),
            Some(OsString::from("cube.frag"))
        );
        assert_eq!(compiled_source_name(Path::new("/out/cube.frag")), None);
        assert_eq!(compiled_source_name(Path::new("notes.txt")), None);
    }

    #[test]
    fn change_set_is_deduped_and_capped() {
        let shared = WatchShared::new();
        for i in 0..(MAX_PENDING_CHANGES + 10) {
            shared.note_binary_change(PathBuf::from(format!("a{}.spv", i)));
        }
        // Duplicate of an existing entry.
        shared.note_binary_change(PathBuf::from("a0.spv"));

        let pending = shared.pending.lock();
        assert_eq!(pending.write().len(), MAX_PENDING_CHANGES);
    }

    #[test]
    fn rebuilds_only_affected_pipelines() {
        let dir = temp_dir("reload");
        let binary = dir.join("cube.frag.spv");
        std::fs::write(&binary, [1u8, 2, 3, 4]).unwrap();

        let mut registry = ReloadRegistry::new();
        registry.register(
            vk::Pipeline::from_raw(1),
            PipelineDesc::default(),
            vec![
                stage(ShaderStage::Vertex, "shaders/cube.vert"),
                stage(ShaderStage::Fragment, "shaders/cube.frag"),
            ],
        );
        registry.register(
            vk::Pipeline::from_raw(2),
            PipelineDesc::default(),
            vec![stage(ShaderStage::Fragment, "shaders/other.frag")],
        );

        let mut deletion = DeletionQueue::new();
        let mut next_handle = 100u64;
        let mut rebuild = |_: &PipelineDesc, stages: &[StageBinary]| {
            // The changed stage carries the new binary.
            let fragment = stages
                .iter()
                .find(|s| s.stage == ShaderStage::Fragment)
                .unwrap();
            assert_eq!(fragment.spirv, vec![1, 2, 3, 4]);
            next_handle += 1;
            Ok(vk::Pipeline::from_raw(next_handle))
        };

        let reloaded = registry.apply_changes(vec![binary], &mut rebuild, &mut deletion);
        assert_eq!(reloaded, 1);

        let pipelines: Vec<_> = registry.registered_pipelines().collect();
        // The affected pipeline has a new handle, the other is untouched.
        assert_eq!(pipelines[0], vk::Pipeline::from_raw(101));
        assert_eq!(pipelines[1], vk::Pipeline::from_raw(2));

        // The old handle is deferred, not destroyed.
        assert_eq!(deletion.pending(), 1);
        assert!(deletion.next_group().is_empty());
        assert!(deletion.next_group().is_empty());
        assert_eq!(
            deletion.next_group(),
            vec![DeferredResource::Pipeline(vk::Pipeline::from_raw(1))]
        );
    }

    #[test]
    fn missing_binary_is_skipped() {
        let mut registry = ReloadRegistry::new();
        registry.register(
            vk::Pipeline::from_raw(1),
            PipelineDesc::default(),
            vec![stage(ShaderStage::Fragment, "shaders/cube.frag")],
        );

        let mut deletion = DeletionQueue::new();
        let mut rebuild =
            |_: &PipelineDesc, _: &[StageBinary]| -> Result<vk::Pipeline> { unreachable!() };

        let reloaded = registry.apply_changes(
            vec![PathBuf::from("/nonexistent/cube.frag.spv")],
            &mut rebuild,
            &mut deletion,
        );
        assert_eq!(reloaded, 0);
        assert_eq!(deletion.pending(), 0);
    }

    #[test]
    fn failed_rebuild_keeps_previous_pipeline() {
        let dir = temp_dir("failed-rebuild");
        let binary = dir.join("solid.frag.spv");
        std::fs::write(&binary, [9u8, 9, 9, 9]).unwrap();

        let mut registry = ReloadRegistry::new();
        registry.register(
            vk::Pipeline::from_raw(5),
            PipelineDesc::default(),
            vec![stage(ShaderStage::Fragment, "solid.frag")],
        );

        let mut deletion = DeletionQueue::new();
        let mut rebuild = |_: &PipelineDesc, _: &[StageBinary]| -> Result<vk::Pipeline> {
            anyhow::bail!("compiler rejected shader")
        };

        let reloaded = registry.apply_changes(vec![binary], &mut rebuild, &mut deletion);
        assert_eq!(reloaded, 0);
        assert_eq!(
            registry.registered_pipelines().next(),
            Some(vk::Pipeline::from_raw(5))
        );
        assert_eq!(deletion.pending(), 0);
    }

    #[test]
    fn unregister_stops_reloads() {
        let mut registry = ReloadRegistry::new();
        registry.register(
            vk::Pipeline::from_raw(1),
            PipelineDesc::default(),
            vec![stage(ShaderStage::Fragment, "cube.frag")],
        );
        registry.unregister(vk::Pipeline::from_raw(1));
        assert!(registry.is_empty());
    }

    #[test]
    fn drain_round_trip_defers_old_pipeline() {
        let source_dir = temp_dir("rt-src");
        let binary_dir = temp_dir("rt-bin");
        let binary = binary_dir.join("tri.vert.spv");
        std::fs::write(&binary, [4u8, 0, 0, 0]).unwrap();

        let config = HotReloadConfig {
            enabled: true,
            source_dir: source_dir.to_string_lossy().into_owned(),
            binary_dir: binary_dir.to_string_lossy().into_owned(),
            source_extensions: vec!["vert".into(), "frag".into()],
            recompile_command: Vec::new(),
        };

        let desc = PipelineDesc::default();
        let mut reloader = PipelineHotReloader::new(&config).unwrap();
        reloader.register(
            vk::Pipeline::from_raw(10),
            desc.clone(),
            vec![stage(ShaderStage::Vertex, "tri.vert")],
        );

        // Simulate the binary watcher having seen the recompiled file.
        reloader.inject_binary_change(binary);

        let mut deletion = DeletionQueue::new();
        let mut rebuilt_desc = None;
        let mut rebuild = |desc: &PipelineDesc, _: &[StageBinary]| {
            rebuilt_desc = Some(desc.clone());
            Ok(vk::Pipeline::from_raw(11))
        };

        let reloaded = reloader.drain_and_reload(&mut rebuild, &mut deletion);
        assert_eq!(reloaded, 1);

        // A second drain with no new events does nothing.
        let reloaded = reloader.drain_and_reload(&mut rebuild, &mut deletion);
        assert_eq!(reloaded, 0);

        // Same descriptor, distinct object; old handle deferred.
        assert_eq!(rebuilt_desc.as_ref(), Some(&desc));
        assert_eq!(
            reloader.registry().registered_pipelines().next(),
            Some(vk::Pipeline::from_raw(11))
        );
        assert_eq!(deletion.pending(), 1);
    }
}
