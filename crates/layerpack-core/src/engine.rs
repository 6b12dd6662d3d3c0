use crate::concurrency::WorkdirLock;
use crate::report::{BuildReport, CleanReport, FetchSummary, WorkdirStatus};
use crate::resolve::{resolve_tree, ResolveTarget};
use crate::CoreError;
use layerpack_elf::{materialize, Markers};
use layerpack_fetch::{
    blobs_from_refs, fetch_all, sha256_file, BlobFetcher, CancelToken, FetchError, Fetcher,
    JsonIndex, PackageIndex,
};
use layerpack_runtime::image::{extract_appimage, prepare_base_from_iso, validate_layer_dir, IsoPaths};
use layerpack_runtime::mounts::unmount_tracked;
use layerpack_runtime::script::{install_script, write_script};
use layerpack_runtime::{
    check_host_prereqs, format_missing, run_in_chroot, running_as_root, ComposeOptions,
    ComposedRoot, HostNeeds, Ignored, Layer, MountTable, Mounter, RuntimeError, Sandbox,
    SystemMounter, UnmountMode,
};
use layerpack_schema::{BaseSource, BuildConfig, RemoteBlob, RuntimeSource};
use layerpack_store::{
    read_json, unpack_archive, write_json_atomic, AssemblyCache, CacheStore, Stage, WorkLayout,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Runs the assembly pipeline for one application in one working directory.
///
/// Every stage is guarded by its flag in `cache.json`; a stage that already
/// completed is skipped, so an interrupted build resumes where it stopped.
/// The composed root is torn down before [`Engine::build`] returns, on
/// success and on failure alike.
pub struct Engine {
    layout: WorkLayout,
    cache_store: CacheStore,
    config: BuildConfig,
    mounter: Box<dyn Mounter>,
    fetcher: Box<dyn Fetcher>,
    table: MountTable,
    cancel: CancelToken,
    preflight: bool,
}

/// Replaceable host seams of an [`Engine`].
pub struct EngineParts {
    pub mounter: Box<dyn Mounter>,
    pub fetcher: Box<dyn Fetcher>,
}

impl Engine {
    /// An engine driving the host's mount tools and fetching over HTTP.
    ///
    /// Host prerequisites and root privileges are checked before a build.
    pub fn new(workdir: impl Into<PathBuf>, config: BuildConfig) -> Self {
        let parts = EngineParts {
            mounter: Box::new(SystemMounter::new(
                config.overlay_driver,
                config.sandbox.command_timeout,
            )),
            fetcher: Box::new(BlobFetcher::new(config.fetch.timeout)),
        };
        let mut engine = Self::with_parts(workdir, config, parts);
        engine.preflight = true;
        engine
    }

    /// An engine over caller-provided seams. No host preflight is done.
    pub fn with_parts(workdir: impl Into<PathBuf>, config: BuildConfig, parts: EngineParts) -> Self {
        let layout = WorkLayout::new(workdir);
        Self {
            cache_store: CacheStore::new(layout.clone()),
            layout,
            config,
            mounter: parts.mounter,
            fetcher: parts.fetcher,
            table: MountTable::new(),
            cancel: CancelToken::new(),
            preflight: false,
        }
    }

    pub fn layout(&self) -> &WorkLayout {
        &self.layout
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Token that stops the engine at the next stage boundary and stops the
    /// retrieval pipeline from starting further downloads.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run every pending stage.
    pub fn build(&self) -> Result<BuildReport, CoreError> {
        info!(
            "assembling {} in {}",
            self.config.app_id,
            self.layout.root().display()
        );
        if self.preflight {
            self.check_host()?;
        }
        let _lock = WorkdirLock::acquire_or_fail(&self.layout.lock_path())?;
        self.layout.initialize()?;

        let mut cache = self.load_cache()?;
        let mut report = BuildReport::new(self.config.app_id.as_str(), self.layout.bundle_dir());

        self.stage_base(&mut cache, &mut report)?;
        self.check_cancelled()?;
        self.stage_runtime(&mut cache, &mut report)?;
        self.check_cancelled()?;
        self.stage_fetch(&mut cache, &mut report)?;
        self.check_cancelled()?;

        let in_root = [Stage::Installed, Stage::Resolved, Stage::Materialized];
        if in_root.iter().all(|s| cache.is_done(*s)) && self.layout.bundle_dir().is_dir() {
            for stage in in_root {
                skip(&mut report, stage);
            }
            report.closure_len = cache.closure_len.unwrap_or(0);
            info!("{} is already assembled", self.config.app_id);
            return Ok(report);
        }

        let root = self.compose(&mut cache, &mut report)?;
        let result = self.run_in_root(root.root(), &mut cache, &mut report);
        let teardown = root.release();
        cache.mounts = self.table.snapshot();
        let saved = self.cache_store.save(&mut cache);

        match teardown {
            Ok(ignored) => {
                for i in &ignored {
                    warn!("teardown: {i}");
                }
                report.ignored.extend(ignored);
                report.ran.push("teardown".to_owned());
            }
            Err(e) if result.is_ok() => return Err(e.into()),
            Err(e) => warn!("teardown after failure: {e}"),
        }
        result?;
        saved?;
        info!(
            "assembled {}: {} librar(ies) in {}",
            self.config.app_id,
            report.closure_len,
            report.bundle_dir.display()
        );
        Ok(report)
    }

    /// Fetch and verify every package without assembling anything.
    pub fn fetch(&self) -> Result<FetchSummary, CoreError> {
        let _lock = WorkdirLock::acquire_or_fail(&self.layout.lock_path())?;
        self.layout.initialize()?;
        let mut cache = self.load_cache()?;
        let blobs = self.package_blobs()?;
        let current = self.packages_current(&cache, &blobs);
        let summary = self.fetch_packages(&blobs)?;
        self.drop_package_records(&mut cache);
        record_fetched(&mut cache, &summary);
        if !current {
            cache.invalidate_from(Stage::Installed);
        }
        cache.mark(Stage::PackagesFetched);
        self.cache_store.save(&mut cache)?;
        Ok(summary)
    }

    /// Release recorded mounts and remove transient state.
    pub fn clean(&self, all: bool) -> Result<CleanReport, CoreError> {
        clean_workdir(self.layout.root(), self.mounter.as_ref(), all)
    }

    fn check_host(&self) -> Result<(), CoreError> {
        let missing = check_host_prereqs(HostNeeds::for_config(&self.config));
        if !missing.is_empty() {
            return Err(CoreError::Prerequisites(format_missing(&missing)));
        }
        if !running_as_root() {
            return Err(RuntimeError::PermissionDenied(
                "assembling needs root for overlay mounts and chroot".to_owned(),
            )
            .into());
        }
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), CoreError> {
        if self.cancel.is_cancelled() {
            warn!("cancelled, stopping before the next stage");
            return Err(CoreError::Cancelled);
        }
        Ok(())
    }

    fn sandbox(&self) -> Sandbox<'_> {
        Sandbox::new(self.mounter.as_ref(), &self.table)
    }

    fn load_cache(&self) -> Result<AssemblyCache, CoreError> {
        let mut cache = self.cache_store.load()?;
        let app_id = self.config.app_id.as_str();
        match cache.app_id.as_deref() {
            Some(previous) if previous != app_id => {
                warn!("workdir was last used for {previous}, redoing packages for {app_id}");
                cache.invalidate_from(Stage::PackagesFetched);
                cache.fetched.clear();
                cache.closure_len = None;
            }
            _ => {}
        }
        cache.app_id = Some(app_id.to_owned());
        Ok(cache)
    }

    fn finish(
        &self,
        cache: &mut AssemblyCache,
        report: &mut BuildReport,
        stage: Stage,
    ) -> Result<(), CoreError> {
        cache.mark(stage);
        cache.mounts = self.table.snapshot();
        self.cache_store.save(cache)?;
        info!("stage {stage} done");
        report.ran.push(stage.to_string());
        Ok(())
    }

    fn base_dir(&self) -> PathBuf {
        match &self.config.base {
            BaseSource::Dir(dir) => dir.clone(),
            BaseSource::Iso(_) => self.layout.base_dir(),
        }
    }

    /// Lower layers, bottom to top.
    fn lowers(&self) -> Vec<PathBuf> {
        let mut lowers = vec![self.base_dir()];
        match &self.config.runtime {
            RuntimeSource::None => {}
            RuntimeSource::Dir(dir) => lowers.push(dir.clone()),
            RuntimeSource::Archive(_) => lowers.push(self.layout.runtime_dir()),
        }
        lowers
    }

    fn stage_base(&self, cache: &mut AssemblyCache, report: &mut BuildReport) -> Result<(), CoreError> {
        if cache.is_done(Stage::BaseReady) && self.base_dir().is_dir() {
            skip(report, Stage::BaseReady);
            return Ok(());
        }
        match &self.config.base {
            BaseSource::Dir(dir) => validate_layer_dir(dir)?,
            BaseSource::Iso(iso) => {
                let paths = IsoPaths {
                    iso: iso.clone(),
                    mount_dir: self.layout.iso_mount_dir(),
                    live_dir: self.layout.iso_live_dir(),
                    base_dir: self.layout.base_dir(),
                };
                prepare_base_from_iso(
                    &paths,
                    self.mounter.as_ref(),
                    &self.table,
                    self.config.sandbox.install_timeout,
                )?;
            }
        }
        cache.invalidate_from(Stage::Installed);
        self.finish(cache, report, Stage::BaseReady)
    }

    fn stage_runtime(
        &self,
        cache: &mut AssemblyCache,
        report: &mut BuildReport,
    ) -> Result<(), CoreError> {
        match &self.config.runtime {
            RuntimeSource::None => Ok(()),
            RuntimeSource::Dir(dir) => {
                if cache.is_done(Stage::RuntimeReady) {
                    skip(report, Stage::RuntimeReady);
                    return Ok(());
                }
                validate_layer_dir(dir)?;
                cache.invalidate_from(Stage::Installed);
                self.finish(cache, report, Stage::RuntimeReady)
            }
            RuntimeSource::Archive(blob) => {
                let recorded = verified_record(cache, blob);
                let archive = match recorded {
                    Some(path) if cache.is_done(Stage::RuntimeFetched) => {
                        skip(report, Stage::RuntimeFetched);
                        path
                    }
                    _ => {
                        let path = self.fetch_one(
                            blob,
                            &self.layout.runtime_download_dir(),
                            &mut report.fetch,
                        )?;
                        cache.fetched.insert(blob.name.clone(), path.clone());
                        cache.flags.set(Stage::RuntimeReady, false);
                        self.finish(cache, report, Stage::RuntimeFetched)?;
                        path
                    }
                };
                self.check_cancelled()?;

                if cache.is_done(Stage::RuntimeReady) {
                    skip(report, Stage::RuntimeReady);
                    return Ok(());
                }
                let dir = self.layout.runtime_dir();
                reset_dir(&dir)?;
                unpack_archive(&archive, &dir)?;
                cache.invalidate_from(Stage::Installed);
                self.finish(cache, report, Stage::RuntimeReady)
            }
        }
    }

    fn stage_fetch(
        &self,
        cache: &mut AssemblyCache,
        report: &mut BuildReport,
    ) -> Result<(), CoreError> {
        let blobs = self.package_blobs()?;
        if cache.is_done(Stage::PackagesFetched) {
            if self.packages_current(cache, &blobs) {
                skip(report, Stage::PackagesFetched);
                return Ok(());
            }
            info!("package set or checksums changed, fetching again");
        }
        let summary = self.fetch_packages(&blobs)?;
        self.drop_package_records(cache);
        record_fetched(cache, &summary);
        report.fetch.fetched.extend(summary.fetched);
        report.fetch.refetched.extend(summary.refetched);
        cache.invalidate_from(Stage::Installed);
        self.finish(cache, report, Stage::PackagesFetched)
    }

    /// True when the recorded downloads are exactly `blobs`, each still
    /// matching its declared checksum.
    fn packages_current(&self, cache: &AssemblyCache, blobs: &[RemoteBlob]) -> bool {
        let runtime = self.runtime_blob_name();
        let recorded = cache
            .fetched
            .keys()
            .filter(|name| Some(name.as_str()) != runtime)
            .count();
        recorded == blobs.len() && blobs.iter().all(|b| verified_record(cache, b).is_some())
    }

    /// Forget every recorded package download, keeping the runtime archive.
    fn drop_package_records(&self, cache: &mut AssemblyCache) {
        let runtime = self.runtime_blob_name();
        cache
            .fetched
            .retain(|name, _| Some(name.as_str()) == runtime);
    }

    fn runtime_blob_name(&self) -> Option<&str> {
        match &self.config.runtime {
            RuntimeSource::Archive(blob) => Some(blob.name.as_str()),
            _ => None,
        }
    }

    /// Packages declared in the configuration followed by those selected
    /// from the index file.
    fn package_blobs(&self) -> Result<Vec<RemoteBlob>, CoreError> {
        let mut blobs = self.config.packages.clone();
        if let Some(file) = &self.config.index_file {
            let index = JsonIndex::load(file)?;
            let refs = index.packages(&self.config.index_names)?;
            for blob in blobs_from_refs(&refs)? {
                if blobs.iter().any(|b| b.name == blob.name) {
                    debug!("{} declared explicitly, ignoring index entry", blob.name);
                    continue;
                }
                blobs.push(blob);
            }
        }
        Ok(blobs)
    }

    /// Fetch `blobs` into `debdir/`. Blobs that fail verification are
    /// fetched exactly once more; any remaining failure fails the stage.
    fn fetch_packages(&self, blobs: &[RemoteBlob]) -> Result<FetchSummary, CoreError> {
        if blobs.is_empty() {
            debug!("no packages to fetch");
            return Ok(FetchSummary::default());
        }
        let dest = self.layout.deb_dir();
        let concurrency = self.config.fetch.concurrency;
        let mut results = fetch_all(blobs, concurrency, &dest, self.fetcher.as_ref(), &self.cancel);

        let retry: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.as_ref().is_err_and(FetchError::is_integrity_failure))
            .map(|(i, _)| i)
            .collect();
        let mut refetched = Vec::new();
        if !retry.is_empty() {
            warn!(
                "{} package(s) failed verification, fetching them once more",
                retry.len()
            );
            let again: Vec<RemoteBlob> = retry.iter().map(|&i| blobs[i].clone()).collect();
            let second = fetch_all(&again, concurrency, &dest, self.fetcher.as_ref(), &self.cancel);
            for (&i, result) in retry.iter().zip(second) {
                refetched.push(blobs[i].name.clone());
                results[i] = result;
            }
        }
        if self.cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let mut fetched = Vec::with_capacity(blobs.len());
        let mut failed = Vec::new();
        for (blob, result) in blobs.iter().zip(results) {
            match result {
                Ok(path) => fetched.push((blob.name.clone(), path)),
                Err(e) => failed.push(format!("{}: {e}", blob.name)),
            }
        }
        if !failed.is_empty() {
            return Err(CoreError::FetchFailed { failed });
        }
        info!("{} package(s) verified", fetched.len());
        Ok(FetchSummary { fetched, refetched })
    }

    fn fetch_one(
        &self,
        blob: &RemoteBlob,
        dest_dir: &Path,
        summary: &mut FetchSummary,
    ) -> Result<PathBuf, CoreError> {
        fs::create_dir_all(dest_dir)?;
        let path = match self.fetcher.fetch(blob, dest_dir) {
            Ok(path) => path,
            Err(e) if e.is_integrity_failure() => {
                warn!("{e}, fetching once more");
                summary.refetched.push(blob.name.clone());
                self.fetcher.fetch(blob, dest_dir)?
            }
            Err(e) => return Err(e.into()),
        };
        summary.fetched.push((blob.name.clone(), path.clone()));
        Ok(path)
    }

    /// Mount the overlay root, adopting one left active by an interrupted
    /// run when its install had already finished.
    fn compose(
        &self,
        cache: &mut AssemblyCache,
        report: &mut BuildReport,
    ) -> Result<ComposedRoot<'_>, CoreError> {
        let fresh = !cache.is_done(Stage::Installed);
        if let Some(root) = self.adopt_or_release(cache, fresh)? {
            report.ran.push("compose".to_owned());
            return Ok(root);
        }

        if fresh {
            reset_dir(&self.layout.init_dir())?;
            cache.invalidate_from(Stage::Installed);
        }
        reset_dir(&self.layout.overlay_work_dir())?;
        let layer = Layer {
            lowers: self.lowers(),
            upper: self.layout.init_dir(),
            work: self.layout.overlay_work_dir(),
            mountpoint: self.layout.rootfs_dir(),
        };
        let root = ComposedRoot::compose(
            &layer,
            ComposeOptions { reuse_upper: !fresh },
            self.mounter.as_ref(),
            &self.table,
        )?;
        cache.mounts = self.table.snapshot();
        self.cache_store.save(cache)?;
        report.ran.push("compose".to_owned());
        Ok(root)
    }

    fn adopt_or_release(
        &self,
        cache: &mut AssemblyCache,
        fresh: bool,
    ) -> Result<Option<ComposedRoot<'_>>, CoreError> {
        if cache.mounts.is_empty() {
            return Ok(None);
        }
        let recorded = std::mem::take(&mut cache.mounts);
        let total = recorded.len();
        let active: Vec<_> = recorded
            .into_iter()
            .filter(|r| self.mounter.is_mounted(&r.target))
            .collect();
        if active.len() < total {
            debug!("dropping {} stale mount record(s)", total - active.len());
        }
        self.table.restore(active);

        let rootfs = self.layout.rootfs_dir();
        if self.table.contains(&rootfs) && !fresh {
            return Ok(Some(ComposedRoot::adopt(
                &rootfs,
                self.mounter.as_ref(),
                &self.table,
            )));
        }
        if !self.table.is_empty() {
            info!("releasing {} mount(s) left by an earlier run", self.table.len());
        }
        let (_, ignored) = release_all(self.mounter.as_ref(), &self.table);
        if !ignored.is_empty() {
            cache.mounts = self.table.snapshot();
            self.cache_store.save(cache)?;
            return Err(CoreError::MountsActive(
                ignored.into_iter().map(|i| i.path).collect(),
            ));
        }
        Ok(None)
    }

    fn run_in_root(
        &self,
        rootfs: &Path,
        cache: &mut AssemblyCache,
        report: &mut BuildReport,
    ) -> Result<(), CoreError> {
        self.check_cancelled()?;
        self.stage_install(rootfs, cache, report)?;
        self.check_cancelled()?;
        let closure = self.stage_resolve(rootfs, cache, report)?;
        self.check_cancelled()?;
        self.stage_materialize(rootfs, &closure, cache, report)
    }

    fn stage_install(
        &self,
        rootfs: &Path,
        cache: &mut AssemblyCache,
        report: &mut BuildReport,
    ) -> Result<(), CoreError> {
        if cache.is_done(Stage::Installed) {
            skip(report, Stage::Installed);
            return Ok(());
        }
        let mut debs = Vec::new();
        for blob in self.package_blobs()? {
            let path = cache
                .fetched
                .get(&blob.name)
                .filter(|p| p.is_file())
                .cloned()
                .ok_or_else(|| FetchError::NotFound(format!("{} was never fetched", blob.name)))?;
            if blob.is_appimage() {
                self.install_appimage(rootfs, &path)?;
            } else {
                debs.push(path);
            }
        }

        if debs.is_empty() {
            debug!("no .deb packages to install");
        } else {
            let script = self.layout.scripts_dir().join("install.sh");
            let refs: Vec<&Path> = debs.iter().map(PathBuf::as_path).collect();
            write_script(&script, &install_script(&refs, self.config.sandbox.trace))?;
            let mut data_dirs = vec![self.layout.deb_dir()];
            data_dirs.extend(self.config.sandbox.data_dirs.iter().cloned());
            info!("installing {} package(s) in the sandbox", debs.len());
            let out = run_in_chroot(
                rootfs,
                &script,
                &data_dirs,
                self.config.sandbox.install_timeout,
                self.sandbox(),
            )?;
            debug!("install output:\n{out}");
        }
        cache.invalidate_from(Stage::Resolved);
        self.finish(cache, report, Stage::Installed)
    }

    /// Unpack an AppImage into `/opt/apps/<app-id>/files` of the root.
    fn install_appimage(&self, rootfs: &Path, appimage: &Path) -> Result<(), CoreError> {
        let app_dir = rootfs.join("opt/apps").join(self.config.app_id.as_str());
        let dest = app_dir.join("files");
        if dest.exists() {
            warn!("{} already holds an AppImage, replacing it", dest.display());
        }
        let scratch = app_dir.join(".extract");
        extract_appimage(appimage, &scratch, &dest, self.config.sandbox.install_timeout)?;
        if let Err(e) = fs::remove_dir(&scratch) {
            debug!("leaving {}: {e}", scratch.display());
        }
        Ok(())
    }

    fn stage_resolve(
        &self,
        rootfs: &Path,
        cache: &mut AssemblyCache,
        report: &mut BuildReport,
    ) -> Result<BTreeMap<PathBuf, Markers>, CoreError> {
        let closure_path = self.layout.closure_path();
        if cache.is_done(Stage::Resolved) {
            if let Some(closure) = read_json::<BTreeMap<PathBuf, Markers>>(&closure_path)? {
                skip(report, Stage::Resolved);
                report.closure_len = closure.len();
                return Ok(closure);
            }
            debug!("{} missing, resolving again", closure_path.display());
        }

        let init_dir = self.layout.init_dir();
        let scripts_dir = self.layout.scripts_dir();
        let resolution = resolve_tree(
            ResolveTarget {
                scan_root: &init_dir,
                lister_root: rootfs,
                scripts_dir: &scripts_dir,
            },
            &self.config.resolve,
            self.sandbox(),
            self.config.sandbox.command_timeout,
            self.config.sandbox.trace,
        )?;
        write_json_atomic(&closure_path, &resolution.closure)?;

        let closure = resolution.closure.clone();
        cache.closure_len = Some(closure.len());
        report.closure_len = closure.len();
        report.resolution = Some(resolution);
        cache.flags.set(Stage::Materialized, false);
        self.finish(cache, report, Stage::Resolved)?;
        Ok(closure)
    }

    fn stage_materialize(
        &self,
        rootfs: &Path,
        closure: &BTreeMap<PathBuf, Markers>,
        cache: &mut AssemblyCache,
        report: &mut BuildReport,
    ) -> Result<(), CoreError> {
        let bundle = self.layout.bundle_dir();
        if cache.is_done(Stage::Materialized) && bundle.is_dir() {
            skip(report, Stage::Materialized);
            return Ok(());
        }
        reset_dir(&bundle)?;
        let materialized = materialize(closure, rootfs, &bundle)?;
        for ignored in &materialized.ignored {
            warn!("materialize: {ignored}");
        }
        report.materialized = Some(materialized);
        self.finish(cache, report, Stage::Materialized)
    }
}

fn skip(report: &mut BuildReport, stage: Stage) {
    debug!("stage {stage} already done");
    report.skipped.push(stage.to_string());
}

/// The recorded download of `blob`, if it still verifies.
fn verified_record(cache: &AssemblyCache, blob: &RemoteBlob) -> Option<PathBuf> {
    let path = cache.fetched.get(&blob.name).filter(|p| p.is_file())?;
    match sha256_file(path) {
        Ok(actual) if blob.checksum.matches(&actual) => Some(path.clone()),
        Ok(_) => {
            debug!("{} no longer matches the checksum of {}", path.display(), blob.name);
            None
        }
        Err(e) => {
            debug!("cannot hash {}: {e}", path.display());
            None
        }
    }
}

fn record_fetched(cache: &mut AssemblyCache, summary: &FetchSummary) {
    for (name, path) in &summary.fetched {
        cache.fetched.insert(name.clone(), path.clone());
    }
}

fn reset_dir(dir: &Path) -> Result<(), CoreError> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

/// Unmount every record in `table`, deepest first. A busy mount is detached
/// lazily once.
fn release_all(mounter: &dyn Mounter, table: &MountTable) -> (Vec<PathBuf>, Vec<Ignored>) {
    let mut released = Vec::new();
    let mut ignored = Vec::new();
    for record in table.snapshot().into_iter().rev() {
        if !table.contains(&record.target) {
            continue;
        }
        let result = match unmount_tracked(mounter, table, &record.target, UnmountMode::Normal) {
            Err(RuntimeError::Busy(_)) => {
                unmount_tracked(mounter, table, &record.target, UnmountMode::Lazy)
            }
            other => other,
        };
        match result {
            Ok(()) => {
                for child in table.under(&record.target) {
                    table.remove(&child.target);
                }
                released.push(record.target);
            }
            Err(e) => ignored.push(Ignored::new(&record.target, e)),
        }
    }
    (released, ignored)
}

/// Progress recorded in `workdir`, read without taking the lock.
pub fn workdir_status(workdir: &Path) -> Result<WorkdirStatus, CoreError> {
    let layout = WorkLayout::new(workdir);
    let cache = CacheStore::new(layout.clone()).load()?;
    let written = layout.cache_path().exists();
    let locked = layout.lock_path().exists()
        && WorkdirLock::try_acquire(&layout.lock_path())?.is_none();
    let (completed, pending): (Vec<Stage>, Vec<Stage>) =
        Stage::ALL.into_iter().partition(|s| cache.is_done(*s));
    Ok(WorkdirStatus {
        workdir: workdir.to_path_buf(),
        app_id: cache.app_id,
        completed: completed.iter().map(ToString::to_string).collect(),
        pending: pending.iter().map(ToString::to_string).collect(),
        fetched: cache.fetched.len(),
        closure_len: cache.closure_len,
        mounts: cache.mounts,
        locked,
        updated_at: written.then_some(cache.updated_at),
    })
}

/// Release the mounts recorded in `workdir` and delete its transient
/// directories; with `all`, downloaded inputs and the cache go too.
///
/// Nothing is deleted while a mount under the workdir is still active.
pub fn clean_workdir(
    workdir: &Path,
    mounter: &dyn Mounter,
    all: bool,
) -> Result<CleanReport, CoreError> {
    let mut report = CleanReport::default();
    if !workdir.exists() {
        return Ok(report);
    }
    let layout = WorkLayout::new(workdir);
    let _lock = WorkdirLock::acquire_or_fail(&layout.lock_path())?;
    let store = CacheStore::new(layout.clone());
    let cache = match store.load() {
        Ok(cache) => Some(cache),
        Err(e) => {
            warn!("unreadable cache, discarding it: {e}");
            None
        }
    };

    let table = MountTable::new();
    if let Some(cache) = &cache {
        table.restore(
            cache
                .mounts
                .iter()
                .filter(|r| mounter.is_mounted(&r.target))
                .cloned(),
        );
    }
    let (unmounted, ignored) = release_all(mounter, &table);
    report.unmounted = unmounted;
    report.ignored = ignored;

    let rootfs = layout.rootfs_dir();
    let mut still: Vec<PathBuf> = table.snapshot().into_iter().map(|r| r.target).collect();
    if mounter.is_mounted(&rootfs) && !still.contains(&rootfs) {
        still.push(rootfs);
    }
    if !still.is_empty() {
        if let Some(mut cache) = cache {
            cache.mounts = table.snapshot();
            store.save(&mut cache)?;
        }
        return Err(CoreError::MountsActive(still));
    }

    let mut dirs = layout.transient_dirs();
    if all {
        dirs.extend(layout.input_dirs());
    }
    for dir in dirs {
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            debug!("removed {}", dir.display());
            report.removed.push(dir);
        }
    }
    let closure = layout.closure_path();
    if closure.exists() {
        fs::remove_file(&closure)?;
    }

    match cache {
        Some(mut cache) if !all => {
            cache.invalidate_from(Stage::Installed);
            cache.mounts.clear();
            cache.closure_len = None;
            store.save(&mut cache)?;
        }
        _ => store.remove()?,
    }
    info!(
        "cleaned {}: {} mount(s) released, {} dir(s) removed",
        workdir.display(),
        report.unmounted.len(),
        report.removed.len()
    );
    Ok(report)
}
