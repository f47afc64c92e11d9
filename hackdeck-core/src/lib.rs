#![doc = "hackdeck-core: the repository-to-slide-deck generation pipeline."]

//! This crate holds every piece of the pipeline that does not depend on how it is invoked:
//! data models, settings, the service traits and their real HTTP/`git` implementations,
//! and the coordinator that sequences them.
//!
//! # Layout
//! - [`download`]: repository URL validation and the `git` fetcher
//! - [`digest`]: bounded codebase digest
//! - [`cache`]: digest cache keyed by URL and commit
//! - [`outline`], [`generate`], [`llm`]: slide outline from a language model
//! - [`deck`]: slide-generation service client
//! - [`job`], [`pipeline`], [`jobs`]: job state machine, coordinator and async job manager
//!
//! # Usage
//! Binaries build a [`pipeline::Coordinator`] from [`config::PipelineSettings`] and the
//! concrete services, then either call [`pipeline::Coordinator::generate`] or hand it to a
//! [`jobs::JobManager`].

pub mod cache;
pub mod config;
pub mod contract;
pub mod deck;
pub mod digest;
pub mod download;
pub mod error;
pub mod generate;
pub mod job;
pub mod jobs;
pub mod llm;
pub mod outline;
pub mod pipeline;
