use std::process::ExitCode;

use anyhow::{Context as _, bail};
use jobflow::{Context, ProcessConfig, Workflow, logging};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    logging::init_from_env().context("initialising logging")?;

    let mut argv = std::env::args().skip(1);
    let Some(command) = argv.next() else {
        bail!("usage: jobflow <command> [args...]");
    };
    let args: Vec<String> = argv.collect();

    let ctx = Context::process_with_config(ProcessConfig::from_env()).await;
    if let Some(e) = ctx.error() {
        bail!("creating process context: {e}");
    }
    let wf = Workflow::new(ctx).await;
    if let Some(e) = wf.error() {
        bail!("opening workflow: {e}");
    }

    let mut job = wf.run(command, args).await.wait().await;
    if let Some(e) = job.last_error() {
        bail!("running job: {e}");
    }
    let info = job.job_info().await;
    println!("job id:      {}", info.id);
    println!("state:       {}", info.state);
    println!("exit status: {}", info.exit_status);
    if let Some(wallclock) = info.wallclock_time {
        println!("wallclock:   {wallclock:?}");
    }
    if let Some(cpu) = info.cpu_time {
        println!("cpu seconds: {cpu}");
    }
    wf.close();

    Ok(match u8::try_from(info.exit_status) {
        Ok(code) => ExitCode::from(code),
        Err(_) => ExitCode::FAILURE,
    })
}
