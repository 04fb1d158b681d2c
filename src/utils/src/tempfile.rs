// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Scratch files with unpredictable names, removed on drop.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::rand;

/// A file created with a random name, deleted when the wrapper goes out of
/// scope. Used for upload spooling and for tests that need a scratch path.
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
    file: Option<File>,
}

impl TempFile {
    /// Creates a uniquely named file in the system temporary directory.
    pub fn new() -> io::Result<Self> {
        Self::new_in(std::env::temp_dir())
    }

    /// Creates a uniquely named file under `dir`.
    pub fn new_in<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        // Retry on the (cryptographically unlikely) name collision.
        for _ in 0..4 {
            let path = dir.as_ref().join(format!("tmp-{}", rand::hex_token(8)));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    return Ok(TempFile {
                        path,
                        file: Some(file),
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "could not create a unique temporary file",
        ))
    }

    /// Returns the path of the file.
    pub fn as_path(&self) -> &Path {
        &self.path
    }

    /// Returns the open file handle, if the file has not been removed.
    pub fn as_file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    /// Removes the file from the filesystem while keeping the wrapper (and
    /// its path) alive. Useful for tests that only need a free path.
    pub fn remove(&mut self) -> io::Result<()> {
        self.file.take();
        std::fs::remove_file(&self.path)
    }

    /// Consumes the wrapper without deleting the file.
    pub fn keep(mut self) -> PathBuf {
        self.file.take();
        let path = std::mem::take(&mut self.path);
        std::mem::forget(self);
        path
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// A directory created with a random name, removed recursively on drop.
#[derive(Debug)]
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    /// Creates a uniquely named directory in the system temporary
    /// directory.
    pub fn new() -> io::Result<Self> {
        for _ in 0..4 {
            let path = std::env::temp_dir().join(format!("tmpdir-{}", rand::hex_token(8)));
            match std::fs::create_dir(&path) {
                Ok(()) => return Ok(TempDir { path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "could not create a unique temporary directory",
        ))
    }

    /// Returns the path of the directory.
    pub fn as_path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn test_create_write_read() {
        let temp = TempFile::new().unwrap();
        let mut file = temp.as_file().unwrap();
        file.write_all(b"scratch").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "scratch");
    }

    #[test]
    fn test_removed_on_drop() {
        let path = {
            let temp = TempFile::new().unwrap();
            temp.as_path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_remove_keeps_path() {
        let mut temp = TempFile::new().unwrap();
        let path = temp.as_path().to_path_buf();
        assert!(path.exists());
        temp.remove().unwrap();
        assert!(!path.exists());
        // Removing twice reports the missing file.
        assert!(temp.remove().is_err());
    }

    #[test]
    fn test_keep_detaches() {
        let temp = TempFile::new().unwrap();
        let path = temp.keep();
        assert!(path.exists());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_tempdir_lifecycle() {
        let path = {
            let dir = TempDir::new().unwrap();
            std::fs::write(dir.as_path().join("inner.txt"), b"x").unwrap();
            dir.as_path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
