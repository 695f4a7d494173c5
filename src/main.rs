use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;
use template_pusher::fanout::FanOutConfig;
use template_pusher::git::{CommitIdentity, Git2};
use template_pusher::gitlab::GitLabClient;
use template_pusher::RunContext;

#[derive(Parser, Debug)]
#[command(
    name = "template-pusher",
    version,
    about = "Copies a template into every repository of a GitLab group and pushes it"
)]
struct Cli {
    /// Id of the group of repositories
    #[arg(long = "groupid", env = "GITLAB_GROUP_ID", default_value = "238")]
    group_id: String,

    /// Private token
    #[arg(long, env = "GITLAB_TOKEN", default_value = "", hide_env_values = true)]
    token: String,

    /// API base URL e.g. https://gitlab-ci.local/api/v4
    #[arg(long = "base_url", env = "GITLAB_BASE_URL", default_value = "")]
    base_url: String,

    /// Directory the repositories are cloned into
    #[arg(long, default_value = "repos")]
    repos_dir: PathBuf,

    /// Directory copied into every repository
    #[arg(long, default_value = "template")]
    template_dir: PathBuf,

    /// Maximum number of repositories processed at once
    #[arg(long, default_value = "2")]
    concurrency: NonZeroUsize,

    /// Maximum random delay in milliseconds before starting each repository
    #[arg(long, default_value = "500")]
    stagger_ms: u64,
}

/// Flags which may also be spelt with a single dash (`-groupid 42`)
const LONG_FLAGS: &[&str] = &[
    "groupid",
    "token",
    "base_url",
    "repos-dir",
    "template-dir",
    "concurrency",
    "stagger-ms",
];

/// Rewrites single dash spellings of the long flags to their double
/// dash form, including the `-flag=value` form
fn normalize_args(args: impl IntoIterator<Item = String>) -> Vec<String> {
    args.into_iter()
        .map(|arg| {
            let Some(flag) = arg.strip_prefix('-').filter(|rest| !rest.starts_with('-')) else {
                return arg;
            };
            let name = flag.split('=').next().unwrap_or(flag);
            if LONG_FLAGS.contains(&name) {
                format!("-{arg}")
            } else {
                arg
            }
        })
        .collect()
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse_from(normalize_args(std::env::args()));

    let client = match GitLabClient::new(&cli.token, &cli.base_url) {
        Ok(client) => client,
        Err(err) => {
            error!("Failed to create client: {err}");
            exit(1);
        }
    };

    let projects = client
        .list_group_projects(&cli.group_id)
        .await
        .unwrap_or_else(|err| {
            warn!("Failed to list projects of group {}: {err}", cli.group_id);
            Vec::new()
        });
    info!("Found {} projects in group {}", projects.len(), cli.group_id);

    let context = RunContext {
        repos_dir: cli.repos_dir,
        template_dir: cli.template_dir,
        fan_out: FanOutConfig {
            concurrency: cli.concurrency,
            max_stagger: Duration::from_millis(cli.stagger_ms),
        },
        identity: CommitIdentity::default(),
    };

    let summary = template_pusher::run(&context, projects, Git2).await;
    summary.log();
}
