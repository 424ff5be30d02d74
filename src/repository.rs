//! Typed gateway over the control-plane API. All status writes use
//! optimistic concurrency: the object's resourceVersion rides along on the
//! replace, and a conflict re-reads and retries a bounded number of times.

use std::fmt::Debug;

use k8s_openapi::api::core::v1::Secret;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::crd::task::TaskStatus;
use crate::crd::workflow::WorkflowStatus;
use crate::crd::{Task, WORKFLOW_LABEL, Workflow};
use crate::error::Result;

const WRITE_CONFLICT_RETRIES: u32 = 3;

/// Replace a Task's status, retrying on write conflicts.
pub async fn update_task_status(api: &Api<Task>, name: &str, status: TaskStatus) -> Result<Task> {
    replace_status(api, name, move |task: &mut Task| {
        task.status = Some(status.clone());
    })
    .await
}

/// Replace a Workflow's status, retrying on write conflicts.
pub async fn update_workflow_status(
    api: &Api<Workflow>,
    name: &str,
    status: WorkflowStatus,
) -> Result<Workflow> {
    replace_status(api, name, move |workflow: &mut Workflow| {
        workflow.status = Some(status.clone());
    })
    .await
}

async fn replace_status<K>(api: &Api<K>, name: &str, set: impl Fn(&mut K)) -> Result<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
{
    let mut latest = api.get(name).await?;
    let mut attempt = 0;
    loop {
        attempt += 1;
        set(&mut latest);
        match api
            .replace_status(name, &PostParams::default(), serde_json::to_vec(&latest)?)
            .await
        {
            Ok(updated) => return Ok(updated),
            Err(kube::Error::Api(response))
                if response.code == 409 && attempt < WRITE_CONFLICT_RETRIES =>
            {
                warn!(resource = %name, attempt, "status write conflict, re-reading");
                latest = api.get(name).await?;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Apply an overlay to an existing Task's spec and metadata and replace the
/// object, retrying on write conflicts. The status subresource is untouched.
pub async fn replace_task(
    api: &Api<Task>,
    name: &str,
    overlay: impl Fn(&mut Task),
) -> Result<Task> {
    let mut latest = api.get(name).await?;
    let mut attempt = 0;
    loop {
        attempt += 1;
        overlay(&mut latest);
        match api.replace(name, &PostParams::default(), &latest).await {
            Ok(updated) => return Ok(updated),
            Err(kube::Error::Api(response))
                if response.code == 409 && attempt < WRITE_CONFLICT_RETRIES =>
            {
                warn!(resource = %name, attempt, "spec write conflict, re-reading");
                latest = api.get(name).await?;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Create a Task, treating AlreadyExists as success so materialization is
/// idempotent.
pub async fn create_task(api: &Api<Task>, task: &Task) -> Result<()> {
    match api.create(&PostParams::default(), task).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// List the child Tasks a Workflow owns, by label.
pub async fn list_children(api: &Api<Task>, workflow: &str) -> Result<Vec<Task>> {
    let selector = format!("{}={}", WORKFLOW_LABEL, workflow);
    let list = api.list(&ListParams::default().labels(&selector)).await?;
    Ok(list.items)
}

/// Delete every child Task a Workflow owns.
pub async fn delete_children(api: &Api<Task>, workflow: &str) -> Result<()> {
    let selector = format!("{}={}", WORKFLOW_LABEL, workflow);
    debug!(workflow = %workflow, "deleting child tasks");
    api.delete_collection(
        &DeleteParams::default(),
        &ListParams::default().labels(&selector),
    )
    .await?;
    Ok(())
}

/// Read one key from a Secret. `Ok(None)` when the secret or key is absent;
/// the caller decides whether a default applies.
pub async fn secret_value(
    client: &Client,
    namespace: &str,
    secret_ref: &str,
    key: &str,
) -> Result<Option<String>> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let Some(secret) = api.get_opt(secret_ref).await? else {
        return Ok(None);
    };
    let Some(data) = secret.data else {
        return Ok(None);
    };
    let Some(bytes) = data.get(key) else {
        return Ok(None);
    };
    Ok(Some(String::from_utf8_lossy(&bytes.0).to_string()))
}
