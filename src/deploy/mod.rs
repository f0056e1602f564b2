//! Per-pull-request preview deployments.
//!
//! ## Module Map
//!
//! ```text
//! ┌────────┐ webhook ┌────────────────────────────────────────────────────┐
//! │ GitHub │ ──────> │  server.rs   (axum Router, one task per delivery)  │
//! │        │         │    └─ webhook.rs  (JSON → PullRequestEvent)         │
//! │        │         │         │                                          │
//! │        │         │         │ PullRequestOrchestrator::handle()        │
//! │        │         │         v                                          │
//! │        │         │  orchestrator.rs (record, workspace, clone, locks) │
//! │        │         │    ├─ router.rs     (EventKind × state → Action)   │
//! │        │         │    └─ pipeline.rs   (install → build → run)        │
//! │        │         │         │                                          │
//! │        │         │         │ every command                            │
//! │        │         │         v                                          │
//! │        │ <────── │  monitor.rs  (stdout/stderr capture, progress)     │
//! └────────┘ comment │    └─ progress.rs (Markdown, comment upsert)       │
//!                    └────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ports and Adapters
//!
//! | Port                | Adapter                          | Test double        |
//! |---------------------|----------------------------------|--------------------|
//! | `Repository`        | `db::SqliteRepository`           | `InMemoryRepository` |
//! | `CommentPublisher`  | `github::GitHubClient`           | `FakeComments`     |
//! | `ProcessSupervisor` | `supervisor::Pm2Supervisor`      | `FakeSupervisor`   |
//!
//! Every record write goes through `store::RecordStore`, which re-reads the
//! row under a per-PR lock and changes only the caller's fields.
//!
//! ## Typical Flow (PR labeled for deployment)
//!
//! 1. `POST /api/v1/github/webhook` with `X-GitHub-Event: pull_request`
//!    and `action: labeled` → `webhook::parse_event()`.
//! 2. The handler answers 202 and spawns `orchestrator.handle(event)`.
//! 3. The record is loaded or created, refreshed, and routed to
//!    `SetLabel(true)`. The PR is not deployed yet, so `deploy()` runs.
//! 4. `deploy()` takes the PR's lock (or skips if a run holds it), recreates
//!    `builds/<repo>/<branch>_<number>`, and clones the branch.
//! 5. `DeploymentPipeline` runs install and build via `sh -c`, allocates a
//!    port, and starts the app under pm2 with `PORT` set.
//! 6. Each step edits the PR's single status comment.

pub mod db;
pub mod github;
pub mod models;
pub mod monitor;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod repository;
pub mod router;
pub mod server;
pub mod store;
pub mod supervisor;
pub mod webhook;
pub mod workspace;

#[cfg(test)]
pub(crate) mod test_support;
