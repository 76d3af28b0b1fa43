//! Integration tests for davcache
//!
//! Drive the public `FileCache` API against a directory-backed remote store,
//! including a wrapper remote whose fetches can be made to fail.

mod util {
    use async_trait::async_trait;
    use davcache::remote::{
        FetchOutcome, LocalDirRemote, PushOutcome, RemoteStore, RemoteStoreError,
    };
    use davcache::{CacheConfig, FileCache};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    pub struct TestEnv {
        dir: TempDir,
    }

    impl TestEnv {
        pub fn new() -> Self {
            let dir = TempDir::new().unwrap();
            std::fs::create_dir_all(dir.path().join("remote")).unwrap();
            Self { dir }
        }

        pub fn remote_dir(&self) -> PathBuf {
            self.dir.path().join("remote")
        }

        fn remote_file(&self, path: &str) -> PathBuf {
            self.remote_dir().join(path.trim_start_matches('/'))
        }

        pub fn seed_remote(&self, path: &str, content: &[u8]) {
            let file = self.remote_file(path);
            if let Some(parent) = file.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(file, content).unwrap();
        }

        pub fn remote_content(&self, path: &str) -> Vec<u8> {
            std::fs::read(self.remote_file(path)).unwrap()
        }

        pub fn rename_remote(&self, old: &str, new: &str) {
            std::fs::rename(self.remote_file(old), self.remote_file(new)).unwrap();
        }

        pub fn config(&self, name: &str) -> CacheConfig {
            CacheConfig::new(self.dir.path().join(name))
        }

        pub async fn cache(&self) -> FileCache {
            self.cache_at("cache").await
        }

        pub async fn cache_at(&self, name: &str) -> FileCache {
            FileCache::init(
                self.config(name),
                Arc::new(LocalDirRemote::new(self.remote_dir())),
            )
            .await
            .unwrap()
        }

        pub fn cache_file_count(&self, name: &str) -> usize {
            std::fs::read_dir(self.config(name).files_dir())
                .unwrap()
                .count()
        }
    }

    /// A remote whose fetches and pushes can be switched to fail
    pub struct FlakyRemote {
        inner: LocalDirRemote,
        fail_fetch: Arc<AtomicBool>,
        fail_push: Arc<AtomicBool>,
    }

    #[async_trait]
    impl RemoteStore for FlakyRemote {
        async fn fetch(
            &self,
            path: &str,
            validator: Option<&str>,
        ) -> Result<FetchOutcome, RemoteStoreError> {
            if self.fail_fetch.load(Ordering::SeqCst) {
                return Err(RemoteStoreError::new("connection refused"));
            }
            self.inner.fetch(path, validator).await
        }

        async fn push(
            &self,
            path: &str,
            content: &[u8],
            validator: Option<&str>,
        ) -> Result<PushOutcome, RemoteStoreError> {
            if self.fail_push.load(Ordering::SeqCst) {
                return Err(RemoteStoreError::new("connection reset"));
            }
            self.inner.push(path, content, validator).await
        }
    }

    pub async fn flaky_cache(env: &TestEnv) -> (FileCache, Arc<AtomicBool>, Arc<AtomicBool>) {
        let fail_fetch = Arc::new(AtomicBool::new(false));
        let fail_push = Arc::new(AtomicBool::new(false));
        let remote = FlakyRemote {
            inner: LocalDirRemote::new(env.remote_dir()),
            fail_fetch: Arc::clone(&fail_fetch),
            fail_push: Arc::clone(&fail_push),
        };
        let cache = FileCache::init(env.config("cache"), Arc::new(remote))
            .await
            .unwrap();
        (cache, fail_fetch, fail_push)
    }
}

mod open_sync_tests {
    use super::util::{flaky_cache, TestEnv};
    use davcache::meta::PdataFlags;
    use davcache::{CacheError, OpenOptions};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    #[tokio::test]
    async fn open_close_without_writes_keeps_pdata() {
        let env = TestEnv::new();
        env.seed_remote("/doc.txt", b"hello");
        let cache = env.cache().await;

        let opened = cache.open("/doc.txt", OpenOptions::default()).await.unwrap();
        assert!(!opened.degraded);
        cache.close(opened.handle).await.unwrap();

        let before = cache.metadata("/doc.txt").await.unwrap().unwrap();
        assert_eq!(before.flags, PdataFlags::Clean);

        // second open hits not-modified and must not rewrite the record
        let opened = cache.open("/doc.txt", OpenOptions::default()).await.unwrap();
        cache.close(opened.handle).await.unwrap();

        let after = cache.metadata("/doc.txt").await.unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn write_sync_roundtrips_through_remote() {
        let env = TestEnv::new();
        env.seed_remote("/doc.txt", b"old");
        let cache = env.cache().await;

        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let opened = cache.open("/doc.txt", OpenOptions::default()).await.unwrap();
        assert_eq!(
            cache.write(opened.handle, &payload, 0).unwrap(),
            payload.len()
        );
        cache.sync("/doc.txt", opened.handle, true).await.unwrap();
        cache.close(opened.handle).await.unwrap();

        // a different client (fresh cache root, same remote) sees the content
        let other = env.cache_at("cache2").await;
        let opened = other.open("/doc.txt", OpenOptions::default()).await.unwrap();
        let read = other.read(opened.handle, payload.len(), 0).unwrap();
        assert_eq!(read, payload);
        other.close(opened.handle).await.unwrap();
    }

    #[tokio::test]
    async fn create_publishes_on_close() {
        let env = TestEnv::new();
        let cache = env.cache().await;

        let err = cache
            .open("/new.txt", OpenOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::NotFound(_)));

        let opened = cache
            .open(
                "/new.txt",
                OpenOptions {
                    create: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        cache.write(opened.handle, b"created locally", 0).unwrap();
        cache.close(opened.handle).await.unwrap();

        assert_eq!(env.remote_content("/new.txt"), b"created locally");
        let pdata = cache.metadata("/new.txt").await.unwrap().unwrap();
        assert_eq!(pdata.flags, PdataFlags::Clean);
        assert!(pdata.remote_validator.is_some());
    }

    #[tokio::test]
    async fn concurrent_opens_share_one_cache_file() {
        let env = TestEnv::new();
        env.seed_remote("/doc.txt", b"shared");
        let cache = Arc::new(env.cache().await);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                cache.open("/doc.txt", OpenOptions::default()).await.unwrap()
            }));
        }

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().handle);
        }

        assert_eq!(cache.open_count(), 8);
        assert_eq!(env.cache_file_count("cache"), 1);

        for handle in &handles {
            assert_eq!(cache.read(*handle, 16, 0).unwrap(), b"shared");
        }
        for handle in handles {
            cache.close(handle).await.unwrap();
        }
        assert_eq!(cache.open_count(), 0);
    }

    #[tokio::test]
    async fn closed_handle_is_invalid() {
        let env = TestEnv::new();
        env.seed_remote("/doc.txt", b"x");
        let cache = env.cache().await;

        let opened = cache.open("/doc.txt", OpenOptions::default()).await.unwrap();
        cache.close(opened.handle).await.unwrap();

        assert!(matches!(
            cache.read(opened.handle, 1, 0),
            Err(CacheError::InvalidHandle(_))
        ));
        assert!(matches!(
            cache.close(opened.handle).await,
            Err(CacheError::InvalidHandle(_))
        ));
    }

    #[tokio::test]
    async fn dup_shares_the_record() {
        let env = TestEnv::new();
        env.seed_remote("/doc.txt", b"dup me");
        let cache = env.cache().await;

        let opened = cache.open("/doc.txt", OpenOptions::default()).await.unwrap();
        let dup = cache.dup(opened.handle).unwrap();

        cache.write(opened.handle, b"DUP", 0).unwrap();
        assert_eq!(cache.read(dup, 6, 0).unwrap(), b"DUP me");

        cache.close(opened.handle).await.unwrap();
        // still open through the duplicate
        assert_eq!(cache.read(dup, 6, 0).unwrap(), b"DUP me");
        cache.close(dup).await.unwrap();

        assert_eq!(env.remote_content("/doc.txt"), b"DUP me");
    }

    #[tokio::test]
    async fn conflicting_push_keeps_record_dirty() {
        let env = TestEnv::new();
        env.seed_remote("/doc.txt", b"v1");
        let cache = env.cache().await;

        let opened = cache.open("/doc.txt", OpenOptions::default()).await.unwrap();
        cache.write(opened.handle, b"local edit", 0).unwrap();

        // the remote copy moves on behind our back
        env.seed_remote("/doc.txt", b"someone else won");

        let err = cache
            .sync("/doc.txt", opened.handle, true)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Conflict { .. }));

        // local content survives and the record stays dirty
        assert_eq!(cache.read(opened.handle, 10, 0).unwrap(), b"local edit");
        let pdata = cache.metadata("/doc.txt").await.unwrap().unwrap();
        assert_eq!(pdata.flags, PdataFlags::Dirty);

        // put the remote back to the version we fetched; the retry succeeds
        env.seed_remote("/doc.txt", b"v1");
        cache.close(opened.handle).await.unwrap();
        assert_eq!(env.remote_content("/doc.txt"), b"local edit");
    }

    #[tokio::test]
    async fn reopen_after_conflict_keeps_unpushed_writes() {
        let env = TestEnv::new();
        env.seed_remote("/doc.txt", b"v1");
        let cache = env.cache().await;

        let opened = cache.open("/doc.txt", OpenOptions::default()).await.unwrap();
        cache.write(opened.handle, b"precious edit", 0).unwrap();

        env.seed_remote("/doc.txt", b"someone else won");
        assert!(cache.close(opened.handle).await.is_err());

        // the reopen must serve the unpushed writes, not fetch over them
        let opened = cache.open("/doc.txt", OpenOptions::default()).await.unwrap();
        assert_eq!(cache.read(opened.handle, 32, 0).unwrap(), b"precious edit");

        // the divergence is still a conflict until the remote is reconciled
        let err = cache
            .sync("/doc.txt", opened.handle, true)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Conflict { .. }));

        env.seed_remote("/doc.txt", b"v1");
        cache.close(opened.handle).await.unwrap();
        assert_eq!(env.remote_content("/doc.txt"), b"precious edit");
    }

    #[tokio::test]
    async fn push_transport_failure_keeps_record_dirty() {
        let env = TestEnv::new();
        env.seed_remote("/doc.txt", b"v1");
        let (cache, _fail_fetch, fail_push) = flaky_cache(&env).await;

        let opened = cache.open("/doc.txt", OpenOptions::default()).await.unwrap();
        cache.write(opened.handle, b"precious local edit", 0).unwrap();

        fail_push.store(true, Ordering::SeqCst);
        let err = cache
            .sync("/doc.txt", opened.handle, true)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Remote { .. }));

        // nothing was pushed, nothing was lost
        let pdata = cache.metadata("/doc.txt").await.unwrap().unwrap();
        assert_eq!(pdata.flags, PdataFlags::Dirty);
        assert_eq!(env.remote_content("/doc.txt"), b"v1");
        assert!(cache.close(opened.handle).await.is_err());

        // the remote moves on while we are cut off; reopening must still
        // serve the unpushed writes and report the divergence on push
        env.seed_remote("/doc.txt", b"v2 from elsewhere");
        fail_push.store(false, Ordering::SeqCst);

        let opened = cache.open("/doc.txt", OpenOptions::default()).await.unwrap();
        assert_eq!(
            cache.read(opened.handle, 32, 0).unwrap(),
            b"precious local edit"
        );
        let err = cache
            .sync("/doc.txt", opened.handle, true)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Conflict { .. }));

        env.seed_remote("/doc.txt", b"v1");
        cache.close(opened.handle).await.unwrap();
        assert_eq!(env.remote_content("/doc.txt"), b"precious local edit");
    }

    #[tokio::test]
    async fn sync_without_put_only_flushes() {
        let env = TestEnv::new();
        env.seed_remote("/doc.txt", b"v1");
        let cache = env.cache().await;

        let opened = cache.open("/doc.txt", OpenOptions::default()).await.unwrap();
        cache.write(opened.handle, b"local", 0).unwrap();
        cache.sync("/doc.txt", opened.handle, false).await.unwrap();

        // nothing was pushed
        assert_eq!(env.remote_content("/doc.txt"), b"v1");
    }
}

mod rename_delete_tests {
    use super::util::TestEnv;
    use davcache::{CacheError, OpenOptions};

    #[tokio::test]
    async fn rename_moves_content_and_old_path_misses() {
        let env = TestEnv::new();
        env.seed_remote("/old.txt", b"payload");
        let cache = env.cache().await;

        let opened = cache.open("/old.txt", OpenOptions::default()).await.unwrap();
        cache.close(opened.handle).await.unwrap();

        // the request layer moves the remote document first, then the cache
        env.rename_remote("/old.txt", "/new.txt");
        cache.rename("/old.txt", "/new.txt").await.unwrap();

        let opened = cache.open("/new.txt", OpenOptions::default()).await.unwrap();
        assert_eq!(cache.read(opened.handle, 16, 0).unwrap(), b"payload");
        cache.close(opened.handle).await.unwrap();

        let err = cache
            .open("/old.txt", OpenOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::NotFound(_)));
        assert!(cache.metadata("/old.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn open_record_syncs_under_renamed_path() {
        let env = TestEnv::new();
        env.seed_remote("/old.txt", b"before");
        let cache = env.cache().await;

        let opened = cache.open("/old.txt", OpenOptions::default()).await.unwrap();
        cache.write(opened.handle, b"after ", 0).unwrap();

        env.rename_remote("/old.txt", "/new.txt");
        cache.rename("/old.txt", "/new.txt").await.unwrap();

        // the caller still names the old path; the push must land on the new
        cache.sync("/old.txt", opened.handle, true).await.unwrap();
        cache.close(opened.handle).await.unwrap();

        assert_eq!(env.remote_content("/new.txt"), b"after ");
    }

    #[tokio::test]
    async fn rename_of_uncached_path_is_missing_metadata() {
        let env = TestEnv::new();
        let cache = env.cache().await;

        let err = cache.rename("/absent", "/target").await.unwrap_err();
        assert!(matches!(err, CacheError::MissingMetadata { .. }));
    }

    #[tokio::test]
    async fn delete_forgets_the_path() {
        let env = TestEnv::new();
        env.seed_remote("/doc.txt", b"bye");
        let cache = env.cache().await;

        let opened = cache.open("/doc.txt", OpenOptions::default()).await.unwrap();
        cache.close(opened.handle).await.unwrap();

        cache.delete("/doc.txt", true).await.unwrap();
        assert!(cache.metadata("/doc.txt").await.unwrap().is_none());
        assert_eq!(env.cache_file_count("cache"), 0);

        // deleting an uncached path is a no-op
        cache.delete("/doc.txt", true).await.unwrap();
    }

    #[tokio::test]
    async fn delete_while_open_keeps_descriptor_working() {
        let env = TestEnv::new();
        env.seed_remote("/doc.txt", b"still readable");
        let cache = env.cache().await;

        let opened = cache.open("/doc.txt", OpenOptions::default()).await.unwrap();
        cache.delete("/doc.txt", true).await.unwrap();

        // POSIX semantics: the open descriptor outlives the unlink
        assert_eq!(cache.read(opened.handle, 14, 0).unwrap(), b"still readable");
        cache.close(opened.handle).await.unwrap();
    }
}

mod grace_tests {
    use super::util::{flaky_cache, TestEnv};
    use davcache::meta::PdataFlags;
    use davcache::{CacheError, OpenOptions};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn grace_serves_stale_copy_flagged_degraded() {
        let env = TestEnv::new();
        env.seed_remote("/doc.txt", b"cached once");
        let (cache, fail_fetch, _fail_push) = flaky_cache(&env).await;

        let opened = cache.open("/doc.txt", OpenOptions::default()).await.unwrap();
        cache.close(opened.handle).await.unwrap();
        let before = cache.metadata("/doc.txt").await.unwrap().unwrap();

        fail_fetch.store(true, Ordering::SeqCst);

        let opened = cache
            .open(
                "/doc.txt",
                OpenOptions {
                    grace_level: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(opened.degraded);
        assert_eq!(cache.read(opened.handle, 16, 0).unwrap(), b"cached once");
        cache.close(opened.handle).await.unwrap();

        // degraded service must not touch the record
        let after = cache.metadata("/doc.txt").await.unwrap().unwrap();
        assert_eq!(before, after);
        assert_eq!(after.flags, PdataFlags::Clean);

        // the next successful fetch returns the path to strict mode
        fail_fetch.store(false, Ordering::SeqCst);
        let opened = cache.open("/doc.txt", OpenOptions::default()).await.unwrap();
        assert!(!opened.degraded);
        cache.close(opened.handle).await.unwrap();
    }

    #[tokio::test]
    async fn zero_grace_surfaces_the_remote_error() {
        let env = TestEnv::new();
        env.seed_remote("/doc.txt", b"cached once");
        let (cache, fail_fetch, _fail_push) = flaky_cache(&env).await;

        let opened = cache.open("/doc.txt", OpenOptions::default()).await.unwrap();
        cache.close(opened.handle).await.unwrap();

        fail_fetch.store(true, Ordering::SeqCst);

        let err = cache
            .open("/doc.txt", OpenOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Remote { .. }));
    }

    #[tokio::test]
    async fn grace_needs_a_local_copy() {
        let env = TestEnv::new();
        let (cache, fail_fetch, _fail_push) = flaky_cache(&env).await;
        fail_fetch.store(true, Ordering::SeqCst);

        let err = cache
            .open(
                "/never-cached.txt",
                OpenOptions {
                    grace_level: 5,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::RemoteUnavailable { .. }));
    }

    #[tokio::test]
    async fn repeated_failures_exhaust_the_grace_level() {
        let env = TestEnv::new();
        env.seed_remote("/doc.txt", b"cached once");
        let (cache, fail_fetch, _fail_push) = flaky_cache(&env).await;

        let opened = cache.open("/doc.txt", OpenOptions::default()).await.unwrap();
        cache.close(opened.handle).await.unwrap();

        fail_fetch.store(true, Ordering::SeqCst);
        let opts = OpenOptions {
            grace_level: 2,
            ..Default::default()
        };

        for _ in 0..2 {
            let opened = cache.open("/doc.txt", opts).await.unwrap();
            assert!(opened.degraded);
            cache.close(opened.handle).await.unwrap();
        }

        // third consecutive failure exceeds the tolerance
        let err = cache.open("/doc.txt", opts).await.unwrap_err();
        assert!(matches!(err, CacheError::Remote { .. }));
    }
}

mod cleanup_tests {
    use super::util::TestEnv;
    use davcache::OpenOptions;

    #[tokio::test]
    async fn first_run_removes_orphans_and_keeps_live_files() {
        let env = TestEnv::new();
        env.seed_remote("/live.txt", b"live");
        let cache = env.cache().await;

        let opened = cache.open("/live.txt", OpenOptions::default()).await.unwrap();
        cache.close(opened.handle).await.unwrap();

        // an orphan left behind by some earlier crash
        let files_dir = env.config("cache").files_dir();
        std::fs::write(files_dir.join("deadbeefcafe"), b"orphan").unwrap();
        assert_eq!(env.cache_file_count("cache"), 2);

        let stats = cache.cleanup(true).await.unwrap();
        assert_eq!(stats.orphans_removed, 1);
        assert_eq!(stats.records_repaired, 0);
        assert_eq!(env.cache_file_count("cache"), 1);

        // the surviving copy still opens and reads
        let opened = cache.open("/live.txt", OpenOptions::default()).await.unwrap();
        assert_eq!(cache.read(opened.handle, 4, 0).unwrap(), b"live");
        cache.close(opened.handle).await.unwrap();
    }

    #[tokio::test]
    async fn first_run_repairs_record_with_missing_file() {
        let env = TestEnv::new();
        env.seed_remote("/doc.txt", b"content");
        let cache = env.cache().await;

        let opened = cache.open("/doc.txt", OpenOptions::default()).await.unwrap();
        let filename = cache
            .metadata("/doc.txt")
            .await
            .unwrap()
            .unwrap()
            .local_filename;
        cache.close(opened.handle).await.unwrap();

        // simulate a torn shutdown that lost the content file
        std::fs::remove_file(env.config("cache").files_dir().join(filename)).unwrap();

        let stats = cache.cleanup(true).await.unwrap();
        assert_eq!(stats.records_repaired, 1);
        assert!(cache.metadata("/doc.txt").await.unwrap().is_none());

        // the path is a plain miss now, refetched from the remote
        let opened = cache.open("/doc.txt", OpenOptions::default()).await.unwrap();
        assert_eq!(cache.read(opened.handle, 7, 0).unwrap(), b"content");
        cache.close(opened.handle).await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_spares_open_files() {
        let env = TestEnv::new();
        env.seed_remote("/held.txt", b"held open");
        let cache = env.cache().await;

        let opened = cache.open("/held.txt", OpenOptions::default()).await.unwrap();

        let stats = cache.cleanup(false).await.unwrap();
        assert_eq!(stats.orphans_removed, 0);
        assert_eq!(cache.read(opened.handle, 9, 0).unwrap(), b"held open");
        cache.close(opened.handle).await.unwrap();
    }
}
