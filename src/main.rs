// src/main.rs - CLI front end for the blade loader controller
use blade_loader::config::Config;
use blade_loader::controller::{ArmController, CycleEvent};
use blade_loader::protocol::Axis;
use blade_loader::transport::SerialTransport;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "blade-loader",
    version,
    about = "Drive a DexArm through a taught blade pick-and-place cycle"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "blade_loader.toml")]
    config: String,

    /// Serial port, overriding the configured one
    #[arg(short, long)]
    port: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List serial ports visible on this host
    Ports,
    /// Home the arm
    Home,
    /// Query the arm's encoder position and print it
    Status,
    /// Teach the current pose as the pick point
    SetPick,
    /// Teach the current Z as the safe transit height
    SetSafeZ,
    /// Teach the current pose as a new hook drop point
    AddHook,
    /// Delete the hook at the given index (later hooks shift down)
    DeleteHook { index: usize },
    /// Delete every taught hook
    ClearHooks,
    /// Print the taught positions
    Taught,
    /// Jog one axis by a signed distance in mm
    Jog {
        axis: Axis,
        #[arg(allow_negative_numbers = true)]
        distance: f64,
    },
    /// Run one pick/place pair against a single hook
    TestHook { index: usize },
    /// Run the full pick-and-place cycle over every taught hook
    Run,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();

    if let Command::Ports = cli.command {
        for port in SerialTransport::list_ports()? {
            println!("{}", port.display());
        }
        return Ok(());
    }

    let mut config = Config::load_or_default(&cli.config)?;
    if let Some(port) = cli.port {
        config.serial.port = port;
    }
    let port = config.serial.port.clone();
    let mut controller = ArmController::new(config);

    // Store-only commands work offline.
    match &cli.command {
        Command::Taught => {
            print_taught(&controller);
            return Ok(());
        }
        Command::DeleteHook { index } => {
            controller.delete_hook(*index)?;
            tracing::info!("Hook {} deleted", index);
            return Ok(());
        }
        Command::ClearHooks => {
            controller.clear_hooks()?;
            tracing::info!("All hooks cleared");
            return Ok(());
        }
        _ => {}
    }

    controller.connect(&port).await?;
    controller.select_pneumatic().await?;

    match cli.command {
        Command::Home => {
            controller.go_home().await?;
            tracing::info!("Arm homed");
        }
        Command::Status => {
            controller.sync_from_encoder().await?;
            let pos = controller.position();
            println!("X: {:.2}  Y: {:.2}  Z: {:.2}", pos.x, pos.y, pos.z);
        }
        Command::SetPick => {
            controller.set_pick().await?;
        }
        Command::SetSafeZ => {
            controller.set_safe_z().await?;
        }
        Command::AddHook => {
            let index = controller.add_hook().await?;
            println!("hook {index} added");
        }
        Command::Jog { axis, distance } => {
            controller.jog(axis, distance).await?;
        }
        Command::TestHook { index } => {
            watch_cycle(&mut controller);
            controller.test_single_hook(index).await?;
        }
        Command::Run => {
            watch_cycle(&mut controller);
            controller.run_full_cycle().await?;
        }
        Command::Ports | Command::Taught | Command::DeleteHook { .. } | Command::ClearHooks => {
            unreachable!("handled before connecting")
        }
    }

    controller.disconnect();
    Ok(())
}

/// Forward cycle events to the log and let Ctrl-C request a stop at the next
/// hook boundary. Both helpers only touch the event channel and the control
/// flags; the controller itself stays on this task.
fn watch_cycle(controller: &mut ArmController) {
    let mut events = controller.events();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                CycleEvent::Status(step) => tracing::info!("{}", step),
                CycleEvent::Progress { completed, total } => {
                    tracing::info!("progress: {}/{}", completed, total)
                }
                CycleEvent::Stopped => tracing::info!("cycle stopped"),
                CycleEvent::Finished => break,
            }
        }
    });

    let handle = controller.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C: stopping at the next hook boundary");
            handle.stop();
        }
    });
}

fn print_taught(controller: &ArmController) {
    let taught = controller.taught();
    match &taught.pick {
        Some(pick) => println!(
            "pick:   X{:.2} Y{:.2} Z{:.2}{}",
            pick.x,
            pick.y,
            pick.z,
            if pick.encoder.is_some() { " (encoder)" } else { "" }
        ),
        None => println!("pick:   not set"),
    }
    println!("safe Z: {:.2}", taught.safe_z);
    if taught.hooks.is_empty() {
        println!("hooks:  none");
    }
    for (index, hook) in taught.hooks.iter().enumerate() {
        println!(
            "hook {index}: X{:.2} Y{:.2} Z{:.2}{}",
            hook.x,
            hook.y,
            hook.z,
            if hook.encoder.is_some() { " (encoder)" } else { "" }
        );
    }
}
