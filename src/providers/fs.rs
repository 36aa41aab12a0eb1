//! Filesystem-backed store writing one JSONL file per execution.
//!
//! Layout under the root: `<instance>/<execution_id>.jsonl` for histories,
//! `orch-queue.jsonl` / `work-queue.jsonl` for the queues, and
//! `.locks/{orch,work}/<token>.lock` sidecars holding peek-locked items so an
//! unacked item survives a process crash and gets redelivered.
use std::path::{Path, PathBuf};

use tokio::{fs, io::AsyncWriteExt};

use super::{filter_new_events, InstanceStore, QueueKind, WorkItem};
use crate::Event;

#[derive(Clone)]
pub struct FsStore {
    root: PathBuf,
    orch_queue_file: PathBuf,
    work_queue_file: PathBuf,
    cap: usize,
    lock_expiry: std::time::Duration,
}

impl FsStore {
    const DEFAULT_LOCK_EXPIRY: std::time::Duration = std::time::Duration::from_secs(30);

    /// Create a new store rooted at the given directory path.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        Self::new_with_lock_expiry(root, reset_on_create, Self::DEFAULT_LOCK_EXPIRY)
    }

    /// Create a new store with a custom peek-lock expiry. Lock sidecars older
    /// than the expiry are treated as abandoned by a dead process and swept
    /// back onto their queue when the store opens.
    pub fn new_with_lock_expiry(
        root: impl AsRef<Path>,
        reset_on_create: bool,
        lock_expiry: std::time::Duration,
    ) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        let orch_q = path.join("orch-queue.jsonl");
        let work_q = path.join("work-queue.jsonl");
        // best-effort create
        let _ = std::fs::create_dir_all(&path);
        let _ = std::fs::OpenOptions::new().create(true).append(true).open(&orch_q);
        let _ = std::fs::OpenOptions::new().create(true).append(true).open(&work_q);
        let store = Self {
            root: path,
            orch_queue_file: orch_q,
            work_queue_file: work_q,
            cap: 1024,
            lock_expiry,
        };
        store.sweep_stale_locks();
        store
    }

    /// Create a new store with a custom history cap (useful for tests).
    pub fn new_with_cap(root: impl AsRef<Path>, reset_on_create: bool, cap: usize) -> Self {
        let mut s = Self::new(root, reset_on_create);
        s.cap = cap;
        s
    }

    fn inst_root(&self, instance: &str) -> PathBuf {
        self.root.join(instance)
    }
    fn exec_path(&self, instance: &str, execution_id: u64) -> PathBuf {
        self.inst_root(instance).join(format!("{execution_id}.jsonl"))
    }
    fn queue_file(&self, kind: QueueKind) -> &PathBuf {
        match kind {
            QueueKind::Orchestrator => &self.orch_queue_file,
            QueueKind::Worker => &self.work_queue_file,
        }
    }
    fn lock_dir(&self, kind: QueueKind) -> PathBuf {
        match kind {
            QueueKind::Orchestrator => self.root.join(".locks/orch"),
            QueueKind::Worker => self.root.join(".locks/work"),
        }
    }
    fn lock_path(&self, kind: QueueKind, token: &str) -> PathBuf {
        self.lock_dir(kind).join(format!("{token}.lock"))
    }

    /// Items currently held under a peek-lock, read from the sidecar files.
    fn locked_items(&self, kind: QueueKind) -> Vec<WorkItem> {
        let mut out = Vec::new();
        if let Ok(rd) = std::fs::read_dir(self.lock_dir(kind)) {
            for ent in rd.flatten() {
                if let Ok(data) = std::fs::read_to_string(ent.path()) {
                    if let Ok(item) = serde_json::from_str::<WorkItem>(&data) {
                        out.push(item);
                    }
                }
            }
        }
        out
    }

    /// Requeue lock sidecars left behind by a crashed process. A sidecar
    /// whose mtime is older than the expiry is returned to the front of its
    /// queue and removed; unreadable metadata counts as stale.
    fn sweep_stale_locks(&self) {
        for kind in [QueueKind::Orchestrator, QueueKind::Worker] {
            let rd = match std::fs::read_dir(self.lock_dir(kind)) {
                Ok(rd) => rd,
                Err(_) => continue,
            };
            let mut recovered = Vec::new();
            for ent in rd.flatten() {
                let stale = ent
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.elapsed().ok())
                    .map(|age| age >= self.lock_expiry)
                    .unwrap_or(true);
                if !stale {
                    continue;
                }
                if let Ok(data) = std::fs::read_to_string(ent.path()) {
                    if let Ok(item) = serde_json::from_str::<WorkItem>(&data) {
                        recovered.push(item);
                    }
                }
                let _ = std::fs::remove_file(ent.path());
            }
            if !recovered.is_empty() {
                let mut items = self.read_queue(kind);
                for item in recovered.into_iter().rev() {
                    if !items.contains(&item) {
                        items.insert(0, item);
                    }
                }
                let _ = self.write_queue(kind, &items);
            }
        }
    }

    fn read_queue(&self, kind: QueueKind) -> Vec<WorkItem> {
        let content = std::fs::read_to_string(self.queue_file(kind)).unwrap_or_default();
        content
            .lines()
            .filter_map(|l| serde_json::from_str::<WorkItem>(l).ok())
            .collect()
    }

    fn write_queue(&self, kind: QueueKind, items: &[WorkItem]) -> Result<(), String> {
        // Rewrite atomically via a temp file rename.
        let qf = self.queue_file(kind);
        let tmp = qf.with_extension("jsonl.tmp");
        {
            let mut tf = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .map_err(|e| e.to_string())?;
            for it in items {
                let line = serde_json::to_string(it).map_err(|e| e.to_string())?;
                use std::io::Write as _;
                tf.write_all(line.as_bytes()).map_err(|e| e.to_string())?;
                tf.write_all(b"\n").map_err(|e| e.to_string())?;
            }
        }
        std::fs::rename(&tmp, qf).map_err(|e| e.to_string())
    }
}

#[async_trait::async_trait]
impl InstanceStore for FsStore {
    async fn create_instance(&self, instance: &str) -> Result<(), String> {
        fs::create_dir_all(&self.root).await.map_err(|e| e.to_string())?;
        let inst_dir = self.inst_root(instance);
        if fs::try_exists(&inst_dir).await.map_err(|e| e.to_string())? {
            return Err(format!("instance already exists: {instance}"));
        }
        fs::create_dir_all(&inst_dir).await.map_err(|e| e.to_string())?;
        // create_new makes the exec file the atomicity point for races on the
        // same id across processes sharing the root
        fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(self.exec_path(instance, 1))
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), String> {
        let inst_dir = self.inst_root(instance);
        if !fs::try_exists(&inst_dir).await.map_err(|e| e.to_string())? {
            return Err(format!("instance not found: {instance}"));
        }
        fs::remove_dir_all(&inst_dir).await.map_err(|e| e.to_string())
    }

    async fn read(&self, instance: &str) -> Vec<Event> {
        let latest = self.latest_execution_id(instance).await.unwrap_or(1);
        self.read_with_execution(instance, latest).await
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String> {
        let latest = self.latest_execution_id(instance).await.unwrap_or(1);
        let path = self.exec_path(instance, latest);
        if !fs::try_exists(&path).await.map_err(|e| e.to_string())? {
            return Err(format!("instance not found: {instance}"));
        }
        let existing = self.read_with_execution(instance, latest).await;
        if existing.len() + new_events.len() > self.cap {
            return Err(format!(
                "history cap exceeded (cap={}, have={}, append={})",
                self.cap,
                existing.len(),
                new_events.len()
            ));
        }
        let accepted = filter_new_events(&existing, new_events);
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| e.to_string())?;
        for ev in accepted {
            let line = serde_json::to_string(&ev).map_err(|e| e.to_string())?;
            file.write_all(line.as_bytes()).await.map_err(|e| e.to_string())?;
            file.write_all(b"\n").await.map_err(|e| e.to_string())?;
        }
        file.flush().await.map_err(|e| e.to_string())
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Ok(mut rd) = fs::read_dir(&self.root).await {
            while let Ok(Some(ent)) = rd.next_entry().await {
                let path = ent.path();
                if let Some(name) = ent.file_name().to_str() {
                    if path.is_dir() && !name.starts_with('.') {
                        out.push(name.to_string());
                    }
                }
            }
        }
        out
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        let inst_dir = self.inst_root(instance);
        let mut max_eid = 0u64;
        if let Ok(mut rd) = fs::read_dir(&inst_dir).await {
            while let Ok(Some(ent)) = rd.next_entry().await {
                if let Some(name) = ent.file_name().to_str() {
                    if let Some(stem) = name.strip_suffix(".jsonl") {
                        if let Ok(id) = stem.parse::<u64>() {
                            max_eid = max_eid.max(id);
                        }
                    }
                }
            }
        }
        if max_eid == 0 {
            None
        } else {
            Some(max_eid)
        }
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        let path = self.exec_path(instance, execution_id);
        let data = fs::read_to_string(&path).await.unwrap_or_default();
        let mut out = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(ev) = serde_json::from_str::<Event>(line) {
                out.push(ev)
            }
        }
        out
    }

    async fn create_new_execution(
        &self,
        instance: &str,
        orchestration: &str,
        input: &str,
    ) -> Result<u64, String> {
        let next = self.latest_execution_id(instance).await.unwrap_or(0) + 1;
        fs::create_dir_all(self.inst_root(instance))
            .await
            .map_err(|e| e.to_string())?;
        let path = self.exec_path(instance, next);
        fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await
            .map_err(|e| e.to_string())?;
        self.append(
            instance,
            vec![Event::OrchestrationStarted {
                name: orchestration.to_string(),
                input: input.to_string(),
            }],
        )
        .await?;
        Ok(next)
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String> {
        // Idempotent enqueue: only append when not already pending or in flight.
        let mut items = self.read_queue(kind);
        if items.contains(&item) || self.locked_items(kind).contains(&item) {
            return Ok(());
        }
        items.push(item);
        self.write_queue(kind, &items)
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let mut items = self.read_queue(kind);
        if items.is_empty() {
            return None;
        }
        let first = items.remove(0);
        self.write_queue(kind, &items).ok()?;
        let now_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let pid = std::process::id();
        let token = format!("{now_ns:x}-{pid:x}");
        let _ = std::fs::create_dir_all(self.lock_dir(kind));
        let line = serde_json::to_string(&first).ok()?;
        let _ = std::fs::write(self.lock_path(kind, &token), line);
        Some((first, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let path = self.lock_path(kind, token);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let path = self.lock_path(kind, token);
        if !path.exists() {
            return Ok(());
        }
        let data = std::fs::read_to_string(&path).map_err(|e| e.to_string())?;
        let item: WorkItem = serde_json::from_str(&data).map_err(|e| e.to_string())?;
        let mut items = self.read_queue(kind);
        items.insert(0, item);
        self.write_queue(kind, &items)?;
        std::fs::remove_file(&path).map_err(|e| e.to_string())
    }

    async fn reset(&self) {
        let _ = fs::remove_dir_all(&self.root).await;
    }

    async fn dump_all_pretty(&self) -> String {
        let mut out = String::new();
        for inst in self.list_instances().await {
            out.push_str(&format!("instance={inst}\n"));
            if let Some(latest) = self.latest_execution_id(&inst).await {
                for eid in 1..=latest {
                    for ev in self.read_with_execution(&inst, eid).await {
                        out.push_str(&format!("  exec#{eid} {ev:#?}\n"));
                    }
                }
            }
        }
        out
    }
}
