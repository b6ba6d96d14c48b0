//! main.rs: UEFI entry for the CobaltOS loader
//!
//! banner -> prompt -> graphics -> open kernel -> load/relocate -> close
//!   -> prepare environment -> capture map -> exit boot services -> jump

#![cfg_attr(target_os = "uefi", no_std)]
#![cfg_attr(target_os = "uefi", no_main)]

#[cfg(target_os = "uefi")]
mod efi {
    use core::convert::Infallible;

    use cobalt_boot::config;
    use cobalt_boot::handoff::Handoff;
    use cobalt_boot::pipeline::load_kernel;
    use cobalt_boot::platform::{graphics, Console, FirmwarePages, KernelFile, UefiFirmware};
    use cobalt_boot::prompt::PromptDecision;
    use cobalt_boot::BootResult;
    use uefi::prelude::*;

    #[entry]
    fn efi_main(image: Handle, mut st: SystemTable<Boot>) -> Status {
        if uefi_services::init(&mut st).is_err() {
            return Status::LOAD_ERROR;
        }
        log::set_max_level(config::log_level());

        let mut console = Console::new(&mut st);
        console.banner();
        if console.firmware_prompt() == PromptDecision::ExitToFirmware {
            log::info!("returning to firmware");
            return Status::SUCCESS;
        }

        match boot(image, &st) {
            Ok(never) => match never {},
            Err(err) if !err.console_usable() => Status(err.status().0),
            Err(err) => {
                log::error!("{}", err);
                Console::new(&mut st).report_failure(&err);
                Status(err.status().0)
            }
        }
    }

    fn boot(image: Handle, st: &SystemTable<Boot>) -> BootResult<Infallible> {
        let graphics = graphics::capture_mode(st);

        let mut file = KernelFile::open(st.boot_services(), image, config::KERNEL_PATH)?;
        let kernel = load_kernel(&mut file, &mut FirmwarePages::new(st.boot_services()))?;
        file.close();

        let loaded = *kernel.loaded();
        // SAFETY: `st` is this image's table and is not used for boot
        // services again once the exit below succeeds.
        let firmware = unsafe { UefiFirmware::new(image, st) };
        let handoff = Handoff::prepare(firmware, &loaded, kernel.was_moved(), graphics)?;

        log::info!("leaving boot services, kernel entry {:#x}", loaded.entrypoint_address);
        let handoff = handoff.capture_memory_map()?.exit_boot_services()?;

        // SAFETY: boot services are gone and `kernel` is the relocated image
        // recorded in the environment.
        unsafe { handoff.transfer(kernel.into_entry()) }
    }
}

#[cfg(not(target_os = "uefi"))]
fn main() {
    eprintln!("cobalt_boot is a UEFI application; build it for x86_64-unknown-uefi");
}
