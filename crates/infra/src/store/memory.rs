//! In-memory job store for tests/dev.
//!
//! A single `RwLock` guards the whole state, so every trait method is one
//! critical section and therefore atomic with respect to every other call.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use jobmesh_core::{Job, JobId, Task, TaskCounts, TaskId, TaskStatus};

use super::{JobFilter, JobStore, StoreError};

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    tasks: HashMap<TaskId, Task>,
    /// Owned task ids per job, ordered by task_index
    job_tasks: HashMap<JobId, Vec<TaskId>>,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: RwLock<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Storage("job store lock poisoned".to_string()))
    }
}

fn counts_for(state: &State, job_id: JobId) -> TaskCounts {
    let statuses = state
        .job_tasks
        .get(&job_id)
        .into_iter()
        .flatten()
        .filter_map(|id| state.tasks.get(id))
        .map(|t| t.status);
    TaskCounts::from_statuses(statuses)
}

impl JobStore for InMemoryJobStore {
    fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists {
                entity: "job",
                id: job.id.to_string(),
            });
        }
        state.jobs.insert(job.id, job.clone());
        state.job_tasks.insert(job.id, Vec::new());
        Ok(())
    }

    fn insert_tasks(&self, tasks: &[Task]) -> Result<(), StoreError> {
        let mut state = self.write()?;

        // Validate everything first so a rejected batch leaves no partial writes.
        let mut indices: HashMap<JobId, HashSet<u32>> = HashMap::new();
        for task in tasks {
            if !state.jobs.contains_key(&task.job_id) {
                return Err(StoreError::job_not_found(task.job_id));
            }
            let taken = indices.entry(task.job_id).or_insert_with(|| {
                state
                    .job_tasks
                    .get(&task.job_id)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| state.tasks.get(id))
                    .map(|t| t.task_index)
                    .collect()
            });
            if state.tasks.contains_key(&task.id) || !taken.insert(task.task_index) {
                return Err(StoreError::AlreadyExists {
                    entity: "task",
                    id: task.id.to_string(),
                });
            }
        }

        for task in tasks {
            state.tasks.insert(task.id.clone(), task.clone());
            state
                .job_tasks
                .entry(task.job_id)
                .or_default()
                .push(task.id.clone());
        }

        let State { tasks: all, job_tasks, .. } = &mut *state;
        for job_id in indices.keys() {
            if let Some(ids) = job_tasks.get_mut(job_id) {
                ids.sort_by_key(|id| all.get(id).map(|t| t.task_index));
            }
        }
        Ok(())
    }

    fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    fn get_task(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.read()?.tasks.get(id).cloned())
    }

    fn list_tasks(&self, job_id: JobId) -> Result<Vec<Task>, StoreError> {
        let state = self.read()?;
        Ok(state
            .job_tasks
            .get(&job_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect())
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<(Vec<Job>, usize), StoreError> {
        let state = self.read()?;
        let needle = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);

        let mut matched: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| match &needle {
                Some(n) => {
                    j.id.to_string().to_lowercase().contains(n)
                        || j.job_type.to_lowercase().contains(n)
                }
                None => true,
            })
            .collect();

        // Newest first; UUIDv7 ids break ties in creation order.
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matched.len();
        let page = matched
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .cloned()
            .collect();
        Ok((page, total))
    }

    fn tasks_with_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<Task>, StoreError> {
        let state = self.read()?;
        let mut matched: Vec<&Task> = state.tasks.values().filter(|t| t.status == status).collect();
        matched.sort_by_key(|t| t.updated_at);
        Ok(matched.into_iter().take(limit).cloned().collect())
    }

    fn update_job(&self, id: JobId, f: &mut dyn FnMut(&mut Job) -> bool) -> Result<Job, StoreError> {
        let mut state = self.write()?;
        let job = state.jobs.get_mut(&id).ok_or(StoreError::job_not_found(id))?;

        let mut draft = job.clone();
        if f(&mut draft) {
            *job = draft;
        }
        Ok(job.clone())
    }

    fn update_task(&self, id: &TaskId, f: &mut dyn FnMut(&mut Task) -> bool) -> Result<Task, StoreError> {
        let mut state = self.write()?;
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::task_not_found(id))?;

        let mut draft = task.clone();
        if f(&mut draft) {
            *task = draft;
        }
        Ok(task.clone())
    }

    fn reconcile_job(
        &self,
        id: JobId,
        f: &mut dyn FnMut(&mut Job, TaskCounts) -> bool,
    ) -> Result<Job, StoreError> {
        let mut state = self.write()?;
        let counts = counts_for(&state, id);
        let job = state.jobs.get_mut(&id).ok_or(StoreError::job_not_found(id))?;

        let mut draft = job.clone();
        if f(&mut draft, counts) {
            *job = draft;
        }
        Ok(job.clone())
    }

    fn delete_job(&self, id: JobId) -> Result<usize, StoreError> {
        let mut state = self.write()?;
        if state.jobs.remove(&id).is_none() {
            return Err(StoreError::job_not_found(id));
        }
        let owned = state.job_tasks.remove(&id).unwrap_or_default();
        for task_id in &owned {
            state.tasks.remove(task_id);
        }
        Ok(owned.len())
    }
}
