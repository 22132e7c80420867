use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};

use chats_export::ScopedLock;
use chats_storage::{
    key_manager::KeyLocation,
    manifest::ArchiveManifest,
    rotation::{rotate_archive, RotationReport},
    EncryptionKey,
};
use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};

use crate::storage::ArchiveContext;

const PENDING_KEY_FILE: &str = ".encryption_key.rotating";

pub fn key_export(ctx: &ArchiveContext, output: Option<&Path>) -> Result<ExitCode> {
    let Some(encoded) = ctx
        .key_manager()
        .export_key()
        .map_err(|e| eyre!(e.to_string()))?
    else {
        println!("No encryption key found");
        return Ok(ExitCode::FAILURE);
    };

    println!("{}", "=".repeat(60));
    println!("ENCRYPTION KEY BACKUP");
    println!("{}", "=".repeat(60));
    println!("Store this key somewhere safe and offline.");
    println!("Anyone holding it can decrypt the whole archive.");
    println!("Without it the archive cannot be recovered.");
    println!("{}", "=".repeat(60));

    match output {
        Some(path) => {
            write_owner_only(path, &encoded)?;
            println!("Key written to {} (owner-only)", path.display());
        }
        None => println!("\n{encoded}\n"),
    }
    Ok(ExitCode::SUCCESS)
}

pub fn key_import(
    ctx: &ArchiveContext,
    file: Option<&Path>,
    key: Option<&str>,
) -> Result<ExitCode> {
    let encoded = match (file, key) {
        (Some(path), _) => match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                println!("File not found: {}", path.display());
                return Ok(ExitCode::FAILURE);
            }
            Err(err) => return Err(err.into()),
        },
        (None, Some(key)) => key.to_string(),
        (None, None) => {
            println!("Enter encryption key:");
            let mut line = String::new();
            io::stdin().read_line(&mut line)?;
            line
        }
    };

    match import(ctx, encoded.trim()) {
        Ok(location) => {
            let target = match location {
                KeyLocation::SecretStore => "the OS credential store".to_string(),
                KeyLocation::LocalFile => ctx.archive.key_file.display().to_string(),
            };
            println!("Key imported to {target}");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            println!("{err}");
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Validate `encoded` and persist it. A key that does not match an existing archive's
/// manifest is refused; it would only make every record unreadable.
fn import(ctx: &ArchiveContext, encoded: &str) -> Result<KeyLocation> {
    let key = EncryptionKey::decode(encoded)
        .map_err(|e| eyre!("invalid key format (expected base64 of 32 bytes): {e}"))?;
    if let Some(manifest) = ArchiveManifest::read(&ctx.archive.manifest_path())? {
        if manifest.key_fingerprint != key.fingerprint() {
            return Err(eyre!(
                "key fingerprint {} does not match this archive ({}); not imported",
                key.fingerprint(),
                manifest.key_fingerprint
            ));
        }
    }
    let (_, location) = ctx
        .key_manager()
        .import_key(encoded)
        .map_err(|e| eyre!(e.to_string()))?;
    info!(fingerprint = %key.fingerprint(), "archive key imported");
    Ok(location)
}

pub fn rotate_key(ctx: &ArchiveContext, lock_timeout: Duration) -> Result<ExitCode> {
    let report = rotate(ctx, lock_timeout)?;
    println!("Re-encrypted {} record file(s)", report.rotated);
    if report.failed > 0 {
        println!(
            "{} file(s) failed verification and were left untouched; they no longer decrypt:",
            report.failed
        );
        for path in &report.failed_paths {
            println!(" - {}", path.display());
        }
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// Re-encrypt under a fresh key while holding the export lock. The new key is parked in an
/// owner-only file until it has been persisted and loads back, so a crash mid-rotation cannot
/// lose it.
fn rotate(ctx: &ArchiveContext, lock_timeout: Duration) -> Result<RotationReport> {
    let _lock = ScopedLock::new(ctx.archive.lock_path())
        .acquire_or_busy(lock_timeout)
        .map_err(|e| eyre!(e.to_string()))?;

    let old_key = ctx.load_key()?;
    let new_key = EncryptionKey::generate();
    let pending = pending_key_path(ctx);
    write_owner_only(&pending, &new_key.encode())?;

    let report = rotate_archive(ctx.root(), &old_key, &new_key).map_err(|e| {
        eyre!(
            "{e}; the new key was kept in {} and the archive still uses the old key",
            pending.display()
        )
    })?;
    ctx.key_manager()
        .import_key(&new_key.encode())
        .map_err(|e| eyre!("{e}; the archive now needs the key in {}", pending.display()))?;
    let active = ctx.load_key()?;
    if active.fingerprint() != new_key.fingerprint() {
        return Err(eyre!(
            "key {} is still the one loaded after rotation; the archive now needs the key in {}",
            active.fingerprint(),
            pending.display()
        ));
    }
    if let Err(err) = fs::remove_file(&pending) {
        warn!(path = %pending.display(), "could not remove pending key file: {err}");
    }
    info!(
        old = %old_key.fingerprint(),
        new = %new_key.fingerprint(),
        "archive key replaced"
    );
    Ok(report)
}

fn pending_key_path(ctx: &ArchiveContext) -> PathBuf {
    ctx.root().join(PENDING_KEY_FILE)
}

fn write_owner_only(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chats_core::secret_store::{InMemorySecretStore, SecretStore, SecretStoreError};
    use chats_storage::ArchiveConfig;
    use serde_json::json;

    use super::*;
    use crate::storage::test_context;

    #[test]
    fn rotation_keeps_records_readable_with_the_new_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(dir.path());
        let record = json!({"title": "kept", "mapping": {}});
        {
            let store = ctx.open_store().expect("open");
            assert!(store.store(&record, &json!({"id": "r1"})));
        }
        let before = ctx.load_key().expect("key");

        let report = rotate(&ctx, Duration::from_millis(200)).expect("rotate");
        assert_eq!(report.rotated, 1);
        assert_eq!(report.failed, 0);
        assert!(!pending_key_path(&ctx).exists());

        let after = ctx.load_key().expect("key");
        assert_ne!(before, after);
        let store = ctx.open_store().expect("open");
        assert!(!store.is_poisoned());
        assert_eq!(store.retrieve("r1"), Some(record));
    }

    /// Serves its seeded entries, refuses writes, and reports deletes as done without
    /// removing anything.
    struct StubbornKeychain(InMemorySecretStore);

    impl SecretStore for StubbornKeychain {
        fn get(&self, service: &str, key: &str) -> Result<Option<String>, SecretStoreError> {
            self.0.get(service, key)
        }

        fn set(&self, _: &str, _: &str, _: &str) -> Result<(), SecretStoreError> {
            Err(SecretStoreError::Unavailable {
                reason: "locked".into(),
            })
        }

        fn delete(&self, _: &str, _: &str) -> Result<(), SecretStoreError> {
            Ok(())
        }
    }

    #[test]
    fn rotation_keeps_pending_key_when_the_old_key_still_loads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let seeded = InMemorySecretStore::new();
        let ctx = ArchiveContext::new(
            ArchiveConfig::new(dir.path()),
            Arc::new(StubbornKeychain(seeded.clone())),
        );
        let before = EncryptionKey::generate();
        seeded
            .set(&ctx.archive.secret_service, &ctx.archive.key_account, &before.encode())
            .expect("seed");
        {
            let store = ctx.open_store().expect("open");
            assert!(store.store(&json!({"title": "kept"}), &json!({"id": "r1"})));
        }

        let err = rotate(&ctx, Duration::from_millis(200)).expect_err("old key still wins");
        assert!(err.to_string().contains(PENDING_KEY_FILE));

        let parked = fs::read_to_string(pending_key_path(&ctx)).expect("pending key kept");
        let parked = EncryptionKey::decode(&parked).expect("decode");
        let manifest = ArchiveManifest::read(&ctx.archive.manifest_path())
            .expect("read")
            .expect("manifest");
        assert_eq!(manifest.key_fingerprint, parked.fingerprint());
        assert_ne!(parked, before);
    }

    #[test]
    fn rotation_waits_for_the_export_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(dir.path());
        ctx.open_store().expect("open");
        let _held = ScopedLock::new(ctx.archive.lock_path())
            .acquire_or_busy(Duration::from_millis(100))
            .expect("lock");

        assert!(rotate(&ctx, Duration::from_millis(150)).is_err());
        assert!(!pending_key_path(&ctx).exists());
    }

    #[test]
    fn import_refuses_a_key_for_another_archive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(dir.path());
        let current = ctx.load_key().expect("key");
        ctx.open_store().expect("open");

        let foreign = EncryptionKey::generate();
        assert!(import(&ctx, &foreign.encode()).is_err());
        assert_eq!(ctx.load_key().expect("key"), current);

        assert!(import(&ctx, "not-a-key").is_err());
        assert_eq!(
            import(&ctx, &current.encode()).expect("import"),
            KeyLocation::SecretStore
        );
    }

    #[test]
    fn import_into_a_fresh_archive_binds_on_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(dir.path().join("fresh"));
        let key = EncryptionKey::generate();
        import(&ctx, &key.encode()).expect("import");
        assert_eq!(ctx.load_key().expect("key"), key);
        assert!(!ctx.open_store().expect("open").is_poisoned());
    }

    #[cfg(unix)]
    #[test]
    fn exported_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("backup.key");
        write_owner_only(&path, "secret").expect("write");
        let mode = fs::metadata(&path).expect("meta").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(fs::read_to_string(&path).expect("read"), "secret");
    }
}
