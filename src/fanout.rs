//! Bounded fan-out of blocking jobs, one per project.
//!
//! Every job needs a permit from a fixed size pool before it may start
//! and gives it back when it returns. Dispatch is staggered by a random
//! delay so the remote host isn't hit by every clone at once.

use crate::gitlab::Project;
use log::debug;
use rand::Rng;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{spawn_blocking, JoinHandle};
use tokio::time::sleep;

#[derive(Debug, Clone, Copy)]
pub struct FanOutConfig {
    /// Maximum number of jobs running at once
    pub concurrency: NonZeroUsize,
    /// Upper bound (exclusive) of the random delay before each dispatch
    pub max_stagger: Duration,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            concurrency: NonZeroUsize::new(2).unwrap_or(NonZeroUsize::MIN),
            max_stagger: Duration::from_millis(500),
        }
    }
}

pub struct FanOut {
    permits: Arc<Semaphore>,
    max_stagger: Duration,
}

impl FanOut {
    pub fn new(config: FanOutConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.concurrency.get())),
            max_stagger: config.max_stagger,
        }
    }

    /// Runs `job` for every project on the blocking pool, returning once
    /// every job has been started. Jobs are independent of each other and
    /// of the caller: a failing or panicking job only releases its permit.
    ///
    /// The handles may be awaited to collect the job outputs or dropped
    /// to leave the jobs running detached.
    pub async fn dispatch<T, F>(&self, projects: Vec<Project>, job: F) -> Vec<JoinHandle<T>>
    where
        F: Fn(Project) -> T + Send + Sync + 'static,
        T: Send + 'static,
    {
        let job = Arc::new(job);
        let mut handles = Vec::with_capacity(projects.len());

        for project in projects {
            let delay = self.stagger();
            if !delay.is_zero() {
                sleep(delay).await;
            }

            // The pool is never closed so acquiring only waits
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };

            debug!("Dispatching {}", project.name);
            let job = job.clone();
            handles.push(spawn_blocking(move || {
                let _permit = permit;
                job(project)
            }));
        }

        handles
    }

    fn stagger(&self) -> Duration {
        if self.max_stagger.is_zero() {
            return Duration::ZERO;
        }
        rand::thread_rng().gen_range(Duration::ZERO..self.max_stagger)
    }
}

#[cfg(test)]
mod test {
    use crate::fanout::{FanOut, FanOutConfig};
    use crate::gitlab::Project;
    use futures::future::join_all;
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn projects(count: usize) -> Vec<Project> {
        (0..count)
            .map(|index| Project {
                name: format!("project-{index}"),
                ssh_url_to_repo: format!("git@gitlab.local:group/project-{index}.git"),
            })
            .collect()
    }

    fn config(concurrency: usize, stagger_ms: u64) -> FanOutConfig {
        FanOutConfig {
            concurrency: NonZeroUsize::new(concurrency).unwrap(),
            max_stagger: Duration::from_millis(stagger_ms),
        }
    }

    #[tokio::test]
    async fn never_exceeds_concurrency() {
        let fan_out = FanOut::new(config(2, 0));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles = {
            let running = running.clone();
            let peak = peak.clone();
            fan_out
                .dispatch(projects(7), move |project| {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(30));
                    running.fetch_sub(1, Ordering::SeqCst);
                    project.name
                })
                .await
        };

        let names: Vec<String> = join_all(handles)
            .await
            .into_iter()
            .map(|result| result.unwrap())
            .collect();

        assert_eq!(names.len(), 7);
        assert_eq!(names[0], "project-0");
        assert_eq!(names[6], "project-6");
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_job_releases_permit() {
        let fan_out = FanOut::new(config(1, 0));

        let handles = fan_out
            .dispatch(projects(3), |project| {
                if project.name == "project-0" {
                    panic!("clone exploded");
                }
                project.name
            })
            .await;

        let results = join_all(handles).await;
        assert!(results[0].is_err());
        assert_eq!(results[1].as_ref().unwrap(), "project-1");
        assert_eq!(results[2].as_ref().unwrap(), "project-2");
    }

    #[tokio::test]
    async fn staggered_dispatch() {
        let fan_out = FanOut::new(config(2, 20));
        let handles = fan_out.dispatch(projects(3), |project| project.name).await;
        assert_eq!(handles.len(), 3);
        assert_eq!(join_all(handles).await.len(), 3);
    }

    #[test]
    fn stagger_stays_below_max() {
        let fan_out = FanOut::new(FanOutConfig {
            concurrency: NonZeroUsize::new(1).unwrap(),
            max_stagger: Duration::from_micros(800),
        });

        let delays: Vec<Duration> = (0..200).map(|_| fan_out.stagger()).collect();
        assert!(delays.iter().all(|delay| *delay < Duration::from_micros(800)));
        // Sub-millisecond bounds still produce a delay
        assert!(delays.iter().any(|delay| !delay.is_zero()));

        let fan_out = FanOut::new(config(1, 0));
        assert_eq!(fan_out.stagger(), Duration::ZERO);
    }

    #[tokio::test]
    async fn no_projects() {
        let fan_out = FanOut::new(FanOutConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let handles = fan_out
            .dispatch(Vec::new(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert!(handles.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
