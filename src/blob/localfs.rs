//! Directory-tree blob store.
//!
//! Dev-grade backend mapping the blob contract onto one directory:
//!
//! ```text
//! <root>/objects/<hex object id>     persistent objects
//! <root>/recovery/<type>/<id>        tagged temporaries
//! <root>/tmp/<n>                     untagged temporaries
//! ```
//!
//! Every file starts with a 16-byte xattr header followed by content bytes.
//! Creation and recovery installs go through rename so an object is either
//! fully present or absent; runtime overwrites copy bytes in place so open
//! content handles stay coherent. `zero` writes literal zeros instead of
//! punching holes, which trades disk space for portability.

use crate::blob::store::{
    BlobError, BlobObject, BlobRecovery, BlobStore, BlobTemporary, Content, ContentSize,
    RecoveredBlobTemporary,
};
use crate::types::{ObjectId, RecoveryId, RecoveryType, TemporaryXattr, Xattr, XATTR_BYTES};
use async_trait::async_trait;
use log::warn;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const HEADER_BYTES: u64 = XATTR_BYTES as u64;
const ZERO_CHUNK: usize = 64 * 1024;

/// Byte range of one backing file, past its xattr header.
///
/// Clones share the file handle; the handle stays valid across renames of
/// the backing path, which is what keeps cached content readable after an
/// object install.
#[derive(Clone)]
pub struct FileContent {
    file: Arc<Mutex<File>>,
}

impl FileContent {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }

    fn read_header(&self) -> Result<[u8; XATTR_BYTES], BlobError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; XATTR_BYTES];
        file.read_exact(&mut header)?;
        Ok(header)
    }

    fn write_header(&self, header: &[u8; XATTR_BYTES]) -> Result<(), BlobError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(header)?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<u8>, BlobError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(HEADER_BYTES))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    fn replace_with(&self, header: &[u8; XATTR_BYTES], data: &[u8]) -> Result<(), BlobError> {
        let mut file = self.file.lock();
        file.set_len(HEADER_BYTES + data.len() as u64)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(header)?;
        file.write_all(data)?;
        Ok(())
    }

    fn sync_data(&self) -> Result<(), BlobError> {
        self.file.lock().sync_data()?;
        Ok(())
    }
}

#[async_trait]
impl Content for FileContent {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), BlobError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(HEADER_BYTES + offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        // Reads past the end marker yield zeros.
        buf[filled..].fill(0);
        Ok(())
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), BlobError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(HEADER_BYTES + offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn zero(&self, offset: u64, len: u64) -> Result<(), BlobError> {
        let mut file = self.file.lock();
        let end_marker = file.metadata()?.len().saturating_sub(HEADER_BYTES);
        let end = (offset + len).min(end_marker);
        if end <= offset {
            return Ok(());
        }
        file.seek(SeekFrom::Start(HEADER_BYTES + offset))?;
        let zeros = [0u8; ZERO_CHUNK];
        let mut remaining = (end - offset) as usize;
        while remaining > 0 {
            let chunk = remaining.min(ZERO_CHUNK);
            file.write_all(&zeros[..chunk])?;
            remaining -= chunk;
        }
        Ok(())
    }

    async fn sync(&self) -> Result<(), BlobError> {
        self.sync_data()
    }

    fn start(&self) -> u64 {
        0
    }

    fn size(&self) -> ContentSize {
        let len = self
            .file
            .lock()
            .metadata()
            .map(|meta| meta.len())
            .unwrap_or(0);
        ContentSize {
            end_marker: len.saturating_sub(HEADER_BYTES),
        }
    }
}

fn object_path(root: &Path, id: ObjectId) -> PathBuf {
    root.join("objects").join(id.to_string())
}

fn recovery_path(root: &Path, id: RecoveryId) -> PathBuf {
    root.join("recovery")
        .join(id.ty.raw().to_string())
        .join(id.id.to_string())
}

fn ensure_layout(root: &Path) -> Result<(), BlobError> {
    fs::create_dir_all(root.join("objects"))?;
    fs::create_dir_all(root.join("tmp"))?;
    for ty in RecoveryType::ALL {
        fs::create_dir_all(root.join("recovery").join(ty.raw().to_string()))?;
    }
    Ok(())
}

fn open_rw(path: &Path) -> Result<Option<File>, BlobError> {
    match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub struct LocalFsStore {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl LocalFsStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let root = root.into();
        ensure_layout(&root)?;
        Ok(Self {
            root,
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl BlobStore for LocalFsStore {
    type Content = FileContent;
    type Object = LocalFsObject;
    type Temporary = LocalFsTemporary;
    type Recovered = LocalFsRecoveredTemporary;

    async fn open_object(&self, id: ObjectId) -> Result<Option<LocalFsObject>, BlobError> {
        let path = object_path(&self.root, id);
        Ok(open_rw(&path)?.map(|file| LocalFsObject {
            path,
            content: FileContent::new(file),
        }))
    }

    fn create_object(
        &self,
        id: ObjectId,
        xattr: Xattr,
        content: LocalFsTemporary,
    ) -> Result<LocalFsObject, BlobError> {
        let path = object_path(&self.root, id);
        if path.exists() {
            return Err(BlobError::AlreadyExists(id));
        }
        content.content.write_header(xattr.as_bytes())?;
        content.content.sync_data()?;
        let (old_path, file_content) = content.consume()?;
        fs::rename(old_path, &path)?;
        Ok(LocalFsObject {
            path,
            content: file_content,
        })
    }

    fn new_temporary(&self) -> Result<LocalFsTemporary, BlobError> {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let path = self.root.join("tmp").join(n.to_string());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        let content = FileContent::new(file);
        content.write_header(&[0u8; XATTR_BYTES])?;
        Ok(LocalFsTemporary {
            root: self.root.clone(),
            content,
            path: Mutex::new(Some(path)),
        })
    }

    async fn sync(&self) -> Result<(), BlobError> {
        // Directory-entry durability only; file data is synced through the
        // content handles that wrote it.
        File::open(self.root.join("objects"))?.sync_all()?;
        File::open(self.root.join("recovery"))?.sync_all()?;
        Ok(())
    }
}

pub struct LocalFsObject {
    path: PathBuf,
    content: FileContent,
}

impl BlobObject for LocalFsObject {
    type Store = LocalFsStore;

    fn xattr(&self) -> Result<Xattr, BlobError> {
        Ok(Xattr(self.content.read_header()?))
    }

    fn set_xattr(&self, xattr: Xattr) -> Result<(), BlobError> {
        self.content.write_header(xattr.as_bytes())
    }

    fn overwrite(&self, xattr: Xattr, content: LocalFsTemporary) -> Result<(), BlobError> {
        let data = content.content.read_all()?;
        self.content.replace_with(xattr.as_bytes(), &data)
    }

    fn remove(&self) -> Result<(), BlobError> {
        fs::remove_file(&self.path)?;
        Ok(())
    }

    fn content(&self) -> FileContent {
        self.content.clone()
    }
}

pub struct LocalFsTemporary {
    root: PathBuf,
    content: FileContent,
    path: Mutex<Option<PathBuf>>,
}

impl LocalFsTemporary {
    fn consume(self) -> Result<(PathBuf, FileContent), BlobError> {
        let path = self
            .path
            .lock()
            .take()
            .ok_or_else(|| BlobError::Backend("temporary already consumed".into()))?;
        Ok((path, self.content.clone()))
    }

    fn rename_to(&self, target: PathBuf) -> Result<(), BlobError> {
        let mut path = self.path.lock();
        let current = path
            .take()
            .ok_or_else(|| BlobError::Backend("temporary already consumed".into()))?;
        match fs::rename(&current, &target) {
            Ok(()) => {
                *path = Some(target);
                Ok(())
            }
            Err(err) => {
                *path = Some(current);
                Err(err.into())
            }
        }
    }
}

impl BlobTemporary for LocalFsTemporary {
    type Store = LocalFsStore;

    fn temporary_xattr(&self) -> Result<TemporaryXattr, BlobError> {
        Ok(TemporaryXattr(self.content.read_header()?))
    }

    fn set_xattr(&self, xattr: TemporaryXattr) -> Result<(), BlobError> {
        self.content.write_header(xattr.as_bytes())
    }

    fn set_recovery_id(&self, id: RecoveryId) -> Result<(), BlobError> {
        self.rename_to(recovery_path(&self.root, id))
    }

    fn set_recovery_id_with_xattr(
        &self,
        id: RecoveryId,
        xattr: TemporaryXattr,
    ) -> Result<(), BlobError> {
        self.content.write_header(xattr.as_bytes())?;
        self.rename_to(recovery_path(&self.root, id))
    }

    fn overwrite(&self, xattr: TemporaryXattr, content: LocalFsTemporary) -> Result<(), BlobError> {
        let data = content.content.read_all()?;
        self.content.replace_with(xattr.as_bytes(), &data)
    }

    fn content(&self) -> FileContent {
        self.content.clone()
    }
}

impl Drop for LocalFsTemporary {
    fn drop(&mut self) {
        if let Some(path) = self.path.get_mut().take() {
            let _ = fs::remove_file(path);
        }
    }
}

pub struct LocalFsRecoveredTemporary {
    old_id: RecoveryId,
    path: Option<PathBuf>,
    content: FileContent,
    objects_root: PathBuf,
    store_root: PathBuf,
}

impl LocalFsRecoveredTemporary {
    fn take_path(&mut self) -> Result<PathBuf, BlobError> {
        self.path
            .take()
            .ok_or_else(|| BlobError::Backend("recovered temporary already consumed".into()))
    }
}

impl RecoveredBlobTemporary for LocalFsRecoveredTemporary {
    type Store = LocalFsStore;

    fn old_id(&self) -> RecoveryId {
        self.old_id
    }

    fn temporary_xattr(&self) -> Result<TemporaryXattr, BlobError> {
        Ok(TemporaryXattr(self.content.read_header()?))
    }

    fn content(&self) -> FileContent {
        self.content.clone()
    }

    fn keep_as_object(mut self, id: ObjectId, xattr: Xattr) -> Result<LocalFsObject, BlobError> {
        self.content.write_header(xattr.as_bytes())?;
        self.content.sync_data()?;
        let old_path = self.take_path()?;
        let target = self.objects_root.join(id.to_string());
        fs::rename(old_path, &target)?;
        Ok(LocalFsObject {
            path: target,
            content: self.content.clone(),
        })
    }

    fn keep_as_temporary(
        mut self,
        id: RecoveryId,
        xattr: TemporaryXattr,
    ) -> Result<LocalFsTemporary, BlobError> {
        self.content.write_header(xattr.as_bytes())?;
        let old_path = self.take_path()?;
        let target = recovery_path(&self.store_root, id);
        fs::rename(old_path, &target)?;
        Ok(LocalFsTemporary {
            root: self.store_root.clone(),
            content: self.content.clone(),
            path: Mutex::new(Some(target)),
        })
    }
}

impl Drop for LocalFsRecoveredTemporary {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = fs::remove_file(path);
        }
    }
}

pub struct LocalFsRecovery {
    root: PathBuf,
    pending: BTreeMap<RecoveryId, PathBuf>,
}

impl LocalFsRecovery {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let root = root.into();
        ensure_layout(&root)?;

        // Untagged temporaries never survive a restart.
        for entry in fs::read_dir(root.join("tmp"))? {
            let _ = fs::remove_file(entry?.path());
        }

        let mut pending = BTreeMap::new();
        for ty in RecoveryType::ALL {
            let dir = root.join("recovery").join(ty.raw().to_string());
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                let id = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .and_then(|name| name.parse::<u64>().ok());
                match id {
                    Some(id) => {
                        pending.insert(RecoveryId::new(ty, id), path);
                    }
                    None => {
                        warn!(
                            "event=recovery_skip_foreign_file path={}",
                            path.display()
                        );
                    }
                }
            }
        }
        Ok(Self { root, pending })
    }
}

impl BlobRecovery for LocalFsRecovery {
    type Store = LocalFsStore;

    fn recover_temporaries(
        &mut self,
        ty: RecoveryType,
    ) -> Result<Vec<LocalFsRecoveredTemporary>, BlobError> {
        let ids: Vec<RecoveryId> = self
            .pending
            .range(RecoveryId::new(ty, 0)..)
            .take_while(|(id, _)| id.ty == ty)
            .map(|(id, _)| *id)
            .collect();
        let mut survivors = Vec::with_capacity(ids.len());
        for id in ids {
            let path = self.pending.remove(&id).expect("pending id just listed");
            let file = open_rw(&path)?
                .ok_or_else(|| BlobError::Backend(format!("survivor {id} vanished")))?;
            survivors.push(LocalFsRecoveredTemporary {
                old_id: id,
                path: Some(path),
                content: FileContent::new(file),
                objects_root: self.root.join("objects"),
                store_root: self.root.clone(),
            });
        }
        Ok(survivors)
    }

    fn get_object(&mut self, id: ObjectId) -> Result<Option<LocalFsObject>, BlobError> {
        let path = object_path(&self.root, id);
        Ok(open_rw(&path)?.map(|file| LocalFsObject {
            path,
            content: FileContent::new(file),
        }))
    }

    fn finish(self) -> LocalFsStore {
        // Survivors nobody reclaimed are deleted for good.
        for path in self.pending.into_values() {
            let _ = fs::remove_file(path);
        }
        LocalFsStore {
            root: self.root,
            tmp_counter: AtomicU64::new(0),
        }
    }
}
