//! Example: resolve, order and "build" a small slice of the Gentoo tree.
//!
//! Models real package atoms with transitive deps, `|| ()` any-of
//! (openssl vs libressl), multi-slot Python, versioned constraints,
//! USE-conditional dependencies and a `:=` rebuild trigger.
//!
//! The plan is resolved twice, with and without `ssl`, then the first one
//! is run through the scheduler with an executor that only sleeps.
//!
//! Set `RUST_LOG=portage_depgraph=debug` to watch the resolver work.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use portage_atom::Cpv;
use portage_depgraph::{
    BuildExecutor, Config, ExecutorError, FixedLoad, InMemoryRepository, Package, PackageMetadata, Phase, Resolution,
    Resolver, ResolverContext, Scheduler, SchedulerConfig,
};

const CONFIG: &str = r#"
[options]
update = true
deep = true
jobs = 3
load-average = 8.0

[use]
enabled = ["ssl", "xml"]
"#;

/// Shorthand to build a PackageMetadata from a CPV string.
fn pkg(cpv: &str, slot: &str, rdepend: &str) -> PackageMetadata {
    let mut meta = PackageMetadata::new(Cpv::parse(cpv).unwrap());
    meta.slot = Some(slot.into());
    meta.dependencies.rdepend = rdepend.into();
    meta.repo = Some("gentoo".into());
    meta.download_size = 1 << 20;
    meta
}

/// Same as [`pkg`] with a sub-slot (e.g. openssl:0/3.2).
fn pkg_subslot(cpv: &str, slot: &str, subslot: &str, rdepend: &str) -> PackageMetadata {
    let mut meta = pkg(cpv, slot, rdepend);
    meta.subslot = Some(subslot.into());
    meta
}

fn with_iuse(mut meta: PackageMetadata, iuse: &[&str]) -> PackageMetadata {
    meta.iuse = iuse.iter().map(|s| s.to_string()).collect();
    meta
}

fn build_repo() -> InMemoryRepository {
    let python = ">=sys-libs/zlib-1.2.13 app-arch/bzip2 xml? ( dev-libs/expat )";
    [
        pkg("sys-libs/zlib-1.2.13", "0", ""),
        pkg("sys-libs/zlib-1.3.1", "0", ""),
        pkg("app-arch/bzip2-1.0.8-r4", "0", ""),
        pkg("dev-libs/expat-2.6.2", "0", ""),
        pkg_subslot("dev-libs/openssl-3.1.7", "0", "3.1", ">=sys-libs/zlib-1.2.13 !dev-libs/libressl"),
        pkg_subslot("dev-libs/openssl-3.2.1", "0", "3.2", ">=sys-libs/zlib-1.2.13 !dev-libs/libressl"),
        pkg("dev-libs/libressl-3.9.2", "0", "sys-libs/zlib !!dev-libs/openssl"),
        pkg("media-libs/libpng-1.6.43", "0", ">=sys-libs/zlib-1.2.13"),
        with_iuse(pkg("dev-lang/python-3.11.9", "3.11", python), &["xml"]),
        with_iuse(pkg("dev-lang/python-3.12.4", "3.12", python), &["xml"]),
        pkg("dev-python/certifi-2024.2.2", "0", "dev-lang/python:*"),
        with_iuse(
            pkg(
                "net-misc/curl-8.7.1",
                "0",
                ">=sys-libs/zlib-1.2.13 || ( dev-libs/openssl dev-libs/libressl ) ssl? ( dev-python/certifi )",
            ),
            &["ssl"],
        ),
        pkg("app-portage/gentoolkit-0.6.3", "0", "dev-lang/python:3.12 dev-python/certifi"),
        pkg(
            "www-client/firefox-125.0.3",
            "0",
            "dev-lang/python:3.11 dev-lang/python:3.12 media-libs/libpng >=dev-libs/openssl-3.2.0:0=",
        ),
    ]
    .into_iter()
    .collect()
}

/// What is already on the system: an old zlib and openssl, and a libpng
/// built against them.
fn build_installed() -> InMemoryRepository {
    [
        pkg("sys-libs/zlib-1.2.13", "0", ""),
        pkg_subslot("dev-libs/openssl-3.1.7", "0", "3.1", ">=sys-libs/zlib-1.2.13 !dev-libs/libressl"),
        pkg("media-libs/libpng-1.6.43", "0", ">=sys-libs/zlib-1.2.13"),
    ]
    .into_iter()
    .collect()
}

const ROOTS: [&str; 3] = ["net-misc/curl", "app-portage/gentoolkit", "www-client/firefox"];

fn resolve_and_print(title: &str, ctx: ResolverContext<'_>) -> Resolution {
    println!("\n{}\n{title}\n{}", "=".repeat(60), "=".repeat(60));
    let resolution = Resolver::new(ctx).resolve_args(&ROOTS);
    print!("{resolution}");
    if let Some(list) = &resolution.merge_list {
        println!("  {} steps in {} batches", list.len(), list.batches.len());
        for (i, batch) in list.batches.iter().enumerate() {
            let names: Vec<String> = batch.iter().map(|&s| list.steps[s].package.to_string()).collect();
            println!("    batch {i}: {}", names.join(" "));
        }
    }
    println!("  ({} attempt(s))", resolution.attempts);
    resolution
}

/// Pretends to build: every phase takes a little while and succeeds.
struct SleepyExecutor;

#[async_trait]
impl BuildExecutor for SleepyExecutor {
    async fn execute_phase(&self, pkg: &Package, phase: Phase) -> Result<i32, ExecutorError> {
        let delay = match phase {
            Phase::Compile => 40,
            Phase::Merge | Phase::Unmerge => 10,
            _ => 2,
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;
        tracing::info!(package = %pkg, %phase, "phase done");
        Ok(0)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .init();

    let config = Config::from_toml_str(CONFIG)?;
    let repo = build_repo();
    let installed = build_installed();

    let ctx = ResolverContext::new(&repo, &installed)
        .with_options(config.options.clone())
        .with_use_config(config.use_config.clone());
    let resolution = resolve_and_print("USE=\"ssl xml\"", ctx);

    let mut no_ssl = config.use_config.clone();
    no_ssl.enabled.remove("ssl");
    let ctx = ResolverContext::new(&repo, &installed)
        .with_options(config.options.clone())
        .with_use_config(no_ssl);
    resolve_and_print("USE=\"xml -ssl\"", ctx);

    let Some(list) = resolution.merge_list else {
        return Ok(());
    };

    println!("\n{}\nbuilding\n{}", "=".repeat(60), "=".repeat(60));
    let mut scheduler = Scheduler::new(SchedulerConfig::from(&config.options), Arc::new(SleepyExecutor))
        .with_load_sampler(Arc::new(FixedLoad(0.5)));
    scheduler.on_task_exit(|task| println!("  {} {}", task.state(), task.package()));
    let report = scheduler.run(&list).await;
    print!("{report}");
    Ok(())
}
