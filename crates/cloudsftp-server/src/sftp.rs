//! SFTP request handling.
//!
//! [`SftpSession`] implements the `russh-sftp` server handler for one
//! channel. It owns the channel's handle table and turns each request into
//! a [`CloudFs`] call; results come back as SFTP status codes.
//!
//! Handles are opaque increasing integers rendered as strings:
//!
//! - read handles are stateless and only remember the path
//! - write handles own a [`StreamingWriter`]
//! - directory handles own a fully materialized [`Lister`] and a cursor
//!
//! Dropping the session drops every writer still open, which aborts their
//! uploads.

use std::collections::HashMap;

use bytes::Bytes;
use cloudsftp_kernel::vfs::{
    normalize_path, CloudFs, Command, EntryInfo, FsError, ListMethod, Lister, StreamingWriter,
};
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Packet, Status, StatusCode,
    Version,
};

use crate::constants::{DIR_PAGE_SIZE, HARDLINK_EXTENSION, MAX_READ_LEN};

/// State behind one handle.
enum OpenHandle {
    Read {
        path: String,
    },
    Write {
        path: String,
        writer: StreamingWriter,
    },
    Dir {
        lister: Lister,
        offset: usize,
    },
}

/// Handler for one SFTP channel.
pub struct SftpSession {
    fs: CloudFs,
    handles: HashMap<String, OpenHandle>,
    next_handle: u64,
}

impl SftpSession {
    pub fn new(fs: CloudFs) -> Self {
        Self {
            fs,
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    fn insert_handle(&mut self, handle: OpenHandle) -> String {
        self.next_handle += 1;
        let id = self.next_handle.to_string();
        self.handles.insert(id.clone(), handle);
        id
    }

    /// Log an adapter failure and map it to a wire status.
    fn fail(&self, op: &'static str, err: FsError) -> StatusCode {
        let code = status_code(&err);
        tracing::debug!(parent: self.fs.span(), op, error = %err, ?code, "request failed");
        code
    }

    async fn stat_path(&self, path: &str) -> Result<EntryInfo, StatusCode> {
        let lister = self
            .fs
            .list(path, ListMethod::Stat)
            .await
            .map_err(|e| self.fail("stat", e))?;
        lister
            .into_entries()
            .into_iter()
            .next()
            .ok_or(StatusCode::NoSuchFile)
    }

    async fn run(&self, id: u32, op: &'static str, cmd: Command) -> Result<Status, StatusCode> {
        self.fs
            .command(cmd)
            .await
            .map(|()| ok_status(id))
            .map_err(|e| self.fail(op, e))
    }
}

impl Drop for SftpSession {
    fn drop(&mut self) {
        let uploads = self
            .handles
            .values()
            .filter(|h| matches!(h, OpenHandle::Write { .. }))
            .count();
        if uploads > 0 {
            tracing::warn!(parent: self.fs.span(), uploads, "session ended with open uploads, aborting");
        }
        tracing::info!(parent: self.fs.span(), "sftp session closed");
    }
}

/// Adapter error → SFTP status.
pub fn status_code(err: &FsError) -> StatusCode {
    match err {
        FsError::NotFound(_) | FsError::StatFailed(_) => StatusCode::NoSuchFile,
        FsError::UnsupportedOperation(_) => StatusCode::OpUnsupported,
        _ => StatusCode::Failure,
    }
}

fn ok_status(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

fn attributes(entry: &EntryInfo) -> FileAttributes {
    let mtime = u32::try_from(entry.mtime_secs()).unwrap_or(u32::MAX);
    FileAttributes {
        size: Some(entry.size),
        permissions: Some(entry.mode()),
        atime: Some(mtime),
        mtime: Some(mtime),
        ..Default::default()
    }
}

/// Split an SFTP extended payload into its length-prefixed strings.
fn ssh_strings(mut data: &[u8]) -> Option<Vec<String>> {
    let mut out = Vec::new();
    while !data.is_empty() {
        let len_bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        let value = data.get(4..4 + len)?;
        out.push(String::from_utf8_lossy(value).into_owned());
        data = &data[4 + len..];
    }
    Some(out)
}

impl russh_sftp::server::Handler for SftpSession {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        tracing::info!(parent: self.fs.span(), client_version = version, "sftp session started");
        let mut reply = Version::new();
        reply
            .extensions
            .insert(HARDLINK_EXTENSION.to_string(), "1".to_string());
        Ok(reply)
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        Ok(Name {
            id,
            files: vec![File::dummy(normalize_path(&path))],
        })
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let path = normalize_path(&filename);
        let writing = pflags.intersects(
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::APPEND,
        );

        let handle = if writing {
            let writer = self
                .fs
                .open_write(&path)
                .await
                .map_err(|e| self.fail("open", e))?;
            OpenHandle::Write { path, writer }
        } else {
            OpenHandle::Read { path }
        };

        Ok(Handle {
            id,
            handle: self.insert_handle(handle),
        })
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let path = match self.handles.get(&handle) {
            Some(OpenHandle::Read { path }) => path.clone(),
            _ => return Err(StatusCode::Failure),
        };

        let data = self
            .fs
            .read(&path, offset, u64::from(len.min(MAX_READ_LEN)))
            .await
            .map_err(|e| self.fail("read", e))?;
        if data.is_empty() {
            return Err(StatusCode::Eof);
        }
        Ok(Data {
            id,
            data: data.to_vec(),
        })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let Some(OpenHandle::Write { writer, .. }) = self.handles.get_mut(&handle) else {
            return Err(StatusCode::Failure);
        };
        match writer.write_at(offset, Bytes::from(data)).await {
            Ok(_) => Ok(ok_status(id)),
            Err(e) => Err(self.fail("write", e)),
        }
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        match self.handles.remove(&handle) {
            Some(OpenHandle::Write { path, writer }) => {
                let size = writer.close().await.map_err(|e| self.fail("close", e))?;
                tracing::debug!(parent: self.fs.span(), path = %path, size, "write handle closed");
                Ok(ok_status(id))
            }
            Some(_) => Ok(ok_status(id)),
            None => Err(StatusCode::Failure),
        }
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let lister = self
            .fs
            .list(&path, ListMethod::List)
            .await
            .map_err(|e| self.fail("opendir", e))?;
        Ok(Handle {
            id,
            handle: self.insert_handle(OpenHandle::Dir { lister, offset: 0 }),
        })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let Some(OpenHandle::Dir { lister, offset }) = self.handles.get_mut(&handle) else {
            return Err(StatusCode::Failure);
        };

        let mut page = vec![EntryInfo::default(); DIR_PAGE_SIZE];
        let at = lister.list_at(&mut page, *offset);
        if at.count == 0 {
            return Err(StatusCode::Eof);
        }
        *offset += at.count;

        let files = page[..at.count]
            .iter()
            .map(|entry| File::new(entry.name(), attributes(entry)))
            .collect();
        Ok(Name { id, files })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let entry = self.stat_path(&path).await?;
        Ok(Attrs {
            id,
            attrs: attributes(&entry),
        })
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        self.stat(id, path).await
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let path = match self.handles.get(&handle) {
            Some(OpenHandle::Write { path, writer }) => {
                let entry = EntryInfo {
                    path: path.clone(),
                    size: writer.accepted(),
                    ..Default::default()
                };
                return Ok(Attrs {
                    id,
                    attrs: attributes(&entry),
                });
            }
            Some(OpenHandle::Read { path }) => path.clone(),
            Some(OpenHandle::Dir { .. }) | None => return Err(StatusCode::Failure),
        };
        let entry = self.stat_path(&path).await?;
        Ok(Attrs {
            id,
            attrs: attributes(&entry),
        })
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        self.run(id, "setstat", Command::Setstat { path }).await
    }

    async fn fsetstat(
        &mut self,
        id: u32,
        handle: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        if self.handles.contains_key(&handle) {
            Ok(ok_status(id))
        } else {
            Err(StatusCode::Failure)
        }
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        self.run(id, "remove", Command::Remove { path: filename })
            .await
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        self.run(id, "mkdir", Command::Mkdir { path }).await
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        self.run(id, "rmdir", Command::Rmdir { path }).await
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        self.run(
            id,
            "rename",
            Command::Rename {
                from: oldpath,
                to: newpath,
            },
        )
        .await
    }

    async fn readlink(&mut self, _id: u32, path: String) -> Result<Name, Self::Error> {
        match self.fs.list(&path, ListMethod::Readlink).await {
            Ok(_) => Err(StatusCode::OpUnsupported),
            Err(e) => Err(self.fail("readlink", e)),
        }
    }

    async fn symlink(
        &mut self,
        id: u32,
        linkpath: String,
        targetpath: String,
    ) -> Result<Status, Self::Error> {
        self.run(
            id,
            "symlink",
            Command::Symlink {
                path: linkpath,
                target: targetpath,
            },
        )
        .await
    }

    async fn extended(
        &mut self,
        id: u32,
        request: String,
        data: Vec<u8>,
    ) -> Result<Packet, Self::Error> {
        if request != HARDLINK_EXTENSION {
            return Err(StatusCode::OpUnsupported);
        }
        let Some([target, path]) = ssh_strings(&data).and_then(|s| <[String; 2]>::try_from(s).ok())
        else {
            return Err(StatusCode::BadMessage);
        };
        let status = self.run(id, "link", Command::Link { path, target }).await?;
        Ok(Packet::Status(status))
    }
}
