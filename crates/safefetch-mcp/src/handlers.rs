//! Protocol-neutral tool handlers.
//!
//! Every task operation is scoped to the caller's owner key. An id that is unknown, expired or
//! owned by someone else is reported as `TaskNotFound`, never as "forbidden".

use safefetch_core::{Error, Result};
use safefetch_local::tasks::{CreateTaskOptions, TaskPage, TaskRecord};
use safefetch_local::{
    read_cached_resource, CachedResource, FetchOutcome, FetchRequest, RequestContext, Services,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct Handlers {
    services: Arc<Services>,
}

fn required<'a>(name: &str, v: &'a str) -> Result<&'a str> {
    let v = v.trim();
    if v.is_empty() {
        return Err(Error::InvalidParams(format!("{name} must be non-empty")));
    }
    Ok(v)
}

impl Handlers {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Run the pipeline inline.
    pub async fn fetch(&self, ctx: &RequestContext, req: FetchRequest) -> Result<FetchOutcome> {
        required("url", &req.url)?;
        self.services.pipeline.resolve(ctx, &req).await
    }

    /// Run the pipeline as a task and return its initial `working` record.
    pub fn fetch_task(
        &self,
        ctx: RequestContext,
        req: FetchRequest,
        ttl_ms: Option<u64>,
    ) -> Result<TaskRecord> {
        required("url", &req.url)?;
        Ok(self.services.pipeline.spawn_task(
            &self.services.tasks,
            ctx,
            req,
            CreateTaskOptions {
                ttl_ms,
                poll_interval_ms: None,
            },
        ))
    }

    pub fn task_get(&self, owner: &str, task_id: &str) -> Result<TaskRecord> {
        let id = required("taskId", task_id)?;
        self.services
            .tasks
            .get_task(id, Some(owner))
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    pub fn task_list(&self, owner: &str, cursor: Option<&str>) -> Result<TaskPage> {
        self.services.tasks.list_tasks(owner, cursor, None)
    }

    pub fn task_cancel(&self, owner: &str, task_id: &str) -> Result<TaskRecord> {
        let id = required("taskId", task_id)?;
        self.services.tasks.cancel_task(id, Some(owner))
    }

    /// Block until the task is terminal, its TTL runs out, or `cancel` fires.
    pub async fn task_result(
        &self,
        owner: &str,
        task_id: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<TaskRecord> {
        let id = required("taskId", task_id)?;
        self.services
            .tasks
            .wait_for_terminal_task(id, Some(owner), cancel)
            .await?
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    pub fn resource_read(&self, uri: &str) -> Result<CachedResource> {
        read_cached_resource(self.services.cache.as_deref(), required("uri", uri)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use safefetch_local::tasks::{TaskStatus, TaskUpdate};
    use safefetch_local::Config;
    use std::time::Duration;

    fn handlers() -> Handlers {
        Handlers::new(Arc::new(Services::start(Config::default()).unwrap()))
    }

    #[tokio::test]
    async fn task_operations_are_owner_scoped() {
        let h = handlers();
        let tasks = &h.services().tasks;
        let t = tasks.create_task(CreateTaskOptions::default(), None, "alice");

        assert_eq!(h.task_get("alice", &t.task_id).unwrap().task_id, t.task_id);
        assert!(matches!(
            h.task_get("bob", &t.task_id),
            Err(Error::TaskNotFound(_))
        ));
        assert!(matches!(
            h.task_cancel("bob", &t.task_id),
            Err(Error::TaskNotFound(_))
        ));
        assert!(h.task_list("bob", None).unwrap().tasks.is_empty());
        assert_eq!(h.task_list("alice", None).unwrap().tasks.len(), 1);

        let c = h.task_cancel("alice", &t.task_id).unwrap();
        assert_eq!(c.status, TaskStatus::Cancelled);
        assert!(matches!(
            h.task_cancel("alice", &t.task_id),
            Err(Error::AlreadyTerminal(_))
        ));
        h.services().shutdown().await;
    }

    #[tokio::test]
    async fn task_result_waits_for_completion() {
        let h = handlers();
        let tasks = Arc::clone(&h.services().tasks);
        let t = tasks.create_task(CreateTaskOptions::default(), None, "alice");
        let id = t.task_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let mut u = TaskUpdate::status(TaskStatus::Completed);
            u.result = Some(serde_json::json!({"ok": true}));
            tasks.update_task(&id, u).unwrap();
        });
        let done = h.task_result("alice", &t.task_id, None).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result, Some(serde_json::json!({"ok": true})));

        assert!(matches!(
            h.task_result("bob", &t.task_id, None).await,
            Err(Error::TaskNotFound(_))
        ));
        h.services().shutdown().await;
    }

    #[tokio::test]
    async fn parameter_errors() {
        let h = handlers();
        assert!(matches!(h.task_get("alice", "  "), Err(Error::InvalidParams(_))));
        assert!(matches!(
            h.task_list("alice", Some("v1:not-base64!")),
            Err(Error::InvalidParams(_))
        ));
        assert!(matches!(
            h.fetch(&RequestContext::new("alice"), FetchRequest::new("")).await,
            Err(Error::InvalidParams(_))
        ));
        assert!(matches!(
            h.fetch(
                &RequestContext::new("alice"),
                FetchRequest::new("http://127.0.0.1:9/")
            )
            .await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            h.resource_read("safefetch://cache/markdown/0123456789abcdef"),
            Err(Error::NotInCache(_))
        ));
        assert!(matches!(
            h.resource_read("https://example.com/"),
            Err(Error::InvalidParams(_))
        ));
        h.services().shutdown().await;
    }
}
