//! tvmm - run a flat guest image with routed MMIO and passthrough interrupts.
//!
//! The guest image is loaded into RAM and entered in real mode. A debug
//! console is mapped at `0xd000_0000`; every access outside RAM goes through
//! the guest's region map. Each `--passthrough` line gets an irqfd-backed
//! physical interrupt wired to the in-kernel irqchip, serviced by a worker
//! thread that relays the guest's EOIs and, with `--passthrough-period`,
//! raises the interrupt periodically.
//!
//! This VMM requires Linux with KVM support on x86_64.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tvmm::debug::{self, Directive, Verbosity};
use tvmm::guest::FaultMode;
use tvmm::SetupError;

#[derive(Parser, Debug)]
#[command(name = "tvmm")]
#[command(about = "A tiny VMM: interrupt passthrough and MMIO trap routing")]
struct Args {
    /// Flat guest binary, entered in real mode
    #[arg(short, long)]
    image: PathBuf,

    /// Guest-physical load and entry address
    #[arg(long, default_value = "0x1000", value_parser = parse_addr)]
    load_addr: u64,

    /// Memory size in megabytes
    #[arg(short, long, default_value = "16")]
    memory: u64,

    /// VM name
    #[arg(short, long, default_value = "vm")]
    name: String,

    /// Log verbosity: quiet|warn|info|trace or <component>=<level>
    /// (components: core, cpu, mmio, irq, dev). Repeatable.
    #[arg(short = 'D', long = "debug")]
    debug: Vec<Directive>,

    /// What an access outside every device does: halt, ignore or inject
    #[arg(long, default_value_t = FaultMode::Inject)]
    fault_mode: FaultMode,

    /// Pass an interrupt through to this irqchip line. Repeatable.
    #[arg(long = "passthrough")]
    passthrough: Vec<u32>,

    /// Raise every passthrough interrupt at this period in milliseconds
    #[arg(long, value_name = "MS")]
    passthrough_period: Option<u64>,
}

fn parse_addr(s: &str) -> Result<u64, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = debug::init(&Verbosity::from_directives(&args.debug)) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    if let Err(e) = run(args) {
        match e.downcast_ref::<SetupError>() {
            Some(fatal) => eprintln!("FATAL: {fatal}"),
            None => eprintln!("Error: {e}"),
        }
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    use std::sync::Arc;
    use tvmm::console::{DebugConsole, CONSOLE_BASE, CONSOLE_SIZE};
    use tvmm::control::{Status, VmControl};
    use tvmm::guest::{Guest, State};
    use tvmm::irq::{HwIrqPassthrough, VcpuId};
    use std::time::Duration;
    use tvmm::kvm::{self, IrqfdLine, IrqfdWorker, KvmIrqChip, VcpuExit};
    use tvmm::mem::{GuestAddr, Region};
    use tvmm::memory::GuestMemory;
    use tvmm::mmio::RegisterMmio;

    tracing::info!(
        target: "core",
        vm = %args.name,
        image = %args.image.display(),
        memory_mib = args.memory,
        fault_mode = %args.fault_mode,
        "starting"
    );

    let vm = Arc::new(kvm::create_vm()?);

    let memory = GuestMemory::new(args.memory * 1024 * 1024)?;
    let (host_addr, size) = memory.as_raw_parts();
    // SAFETY: `memory` lives until the end of this function, past the last
    // vCPU run.
    unsafe {
        vm.set_user_memory_region(0, 0, size, host_addr)?;
    }
    memory.load_image_file(&args.image, args.load_addr)?;

    let boot_cpu = VcpuId(0);
    let irqchip = KvmIrqChip::new(vm.clone());
    let period = args.passthrough_period.map(Duration::from_millis);
    let mut passthrough = Vec::with_capacity(args.passthrough.len());
    for &line in &args.passthrough {
        let hw_irq = IrqfdLine::new(vm.clone())?;
        let dev = HwIrqPassthrough::new(boot_cpu, hw_irq, irqchip.clone(), line)?;
        passthrough.push(IrqfdWorker::spawn(dev, irqchip.clone(), period)?);
    }

    let console = RegisterMmio::new("console", DebugConsole::new(std::io::stdout()));
    let mut guest = Guest::new(args.name.clone(), args.fault_mode);
    guest.add_mmio_device(Region::ss(GuestAddr(CONSOLE_BASE), CONSOLE_SIZE), &console)?;

    let mut vcpu = vm.create_vcpu(boot_cpu)?;
    vcpu.setup_real_mode(args.load_addr)?;
    guest.resume();

    while guest.state() == State::Running {
        match vcpu.run(&guest)? {
            // A halted guest is already crashed and leaves the loop.
            VcpuExit::Mmio(_) | VcpuExit::Io => {}
            VcpuExit::Hlt => {
                tracing::info!(target: "cpu", vcpu = %boot_cpu, "guest halted");
                guest.shutdown();
            }
            VcpuExit::Shutdown => {
                tracing::info!(target: "cpu", vcpu = %boot_cpu, "guest shutdown");
                guest.shutdown();
            }
            VcpuExit::SystemEvent(event) => {
                tracing::info!(target: "cpu", vcpu = %boot_cpu, event, "system event");
                guest.shutdown();
            }
            VcpuExit::InternalError => {
                tracing::error!(target: "cpu", vcpu = %boot_cpu, "KVM internal error");
                guest.halt();
            }
            VcpuExit::FailEntry(reason) => {
                tracing::error!(target: "cpu", vcpu = %boot_cpu, reason, "failed to enter guest");
                guest.halt();
            }
            VcpuExit::Unknown(reason) => {
                tracing::warn!(target: "cpu", vcpu = %boot_cpu, reason, "unhandled exit");
                guest.halt();
            }
        }

        if guest.take_reset_request() {
            vcpu.setup_real_mode(args.load_addr)?;
        }
    }

    let ctl = VmControl::new(&guest);
    tracing::info!(
        target: "core",
        vm = %ctl.name(),
        status = %ctl.status(),
        vcpu_time_us = ctl.vcpu_time(),
        "VM stopped"
    );
    drop(passthrough);

    if ctl.status() == Status::Crashed {
        return Err(format!("guest '{}' crashed", ctl.name()).into());
    }
    Ok(())
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn run(_args: Args) -> Result<(), Box<dyn std::error::Error>> {
    Err("tvmm requires Linux with KVM support on x86_64. This platform is not supported.".into())
}
