//! Thin request-building layer over `reqwest`.
//!
//! Endpoint modules under [`crate::federation`] build `SendRequest`s; the
//! server decides which client executes them and with which middleware.

use std::ops::{Deref, DerefMut};

use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, Request as ReqwestRequest};
use thiserror::Error;
use url::{ParseError, Url};

/// A federation request under construction.
#[derive(Debug)]
pub struct SendRequest {
    inner: ReqwestRequest,
}

macro_rules! method {
    ($name:ident, $method:ident) => {
        /// Start a request with this HTTP method.
        pub fn $name(url: Url) -> SendRequest {
            SendRequest {
                inner: ReqwestRequest::new(Method::$method, url),
            }
        }
    };
}

method!(get, GET);
method!(put, PUT);
method!(post, POST);
method!(delete, DELETE);

/// An error while building or executing a federation request.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("parse url: `{0}`")]
    Url(#[from] ParseError),
    #[error("reqwest: `{0}`")]
    Reqwest(#[from] reqwest::Error),
    #[error("json: `{0}`")]
    Json(#[from] serde_json::Error),
    #[error("other: `{0}`")]
    Other(String),
}

impl SendError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

pub type SendResult<T> = Result<T, SendError>;

impl SendRequest {
    /// Attach the given value as the JSON body of the request.
    pub fn json_body<T: serde::Serialize>(mut self, body: &T) -> SendResult<Self> {
        let bytes = serde_json::to_vec(body)?;
        *self.inner.body_mut() = Some(bytes.into());
        if !self.headers().contains_key(CONTENT_TYPE) {
            self.inner
                .headers_mut()
                .insert(CONTENT_TYPE, "application/json".parse().expect("static header"));
        }
        Ok(self)
    }

    /// The underlying `reqwest::Request`, ready for execution.
    pub fn into_inner(self) -> ReqwestRequest {
        self.inner
    }
}

impl Deref for SendRequest {
    type Target = ReqwestRequest;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for SendRequest {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}
