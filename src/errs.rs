// Copyright (c) Sienna Satterwhite, FelixDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("os i/o error: {0}")]
    Io(io::Error),
    #[error("invalid on-disk format: {0}")]
    InvalidFormat(String),
    #[error("entry not found")]
    NotFound,
    #[error("newest entry for the key is a remove order")]
    RemoveOrder,
}

pub type Result<T> = std::result::Result<T, StorageError>;
