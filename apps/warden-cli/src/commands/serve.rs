// serve.rs: Run the governance daemon in the foreground.
//
// Same startup path as the `warden-daemon` binary, so operators only need
// one executable.

use warden_gate::{GateConfig, GateRuntime};

pub fn execute(
    mut config: GateConfig,
    bind: Option<String>,
    acknowledge_shutdown: bool,
) -> anyhow::Result<()> {
    if let Some(bind) = bind {
        config.bind = bind;
    }
    let bind = config.bind.clone();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let runtime = GateRuntime::open(config, acknowledge_shutdown).await?;
        warden_daemon::serve(runtime.gate, &bind).await?;
        Ok::<(), anyhow::Error>(())
    })
}
