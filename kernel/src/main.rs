// =============================================================================
// PMOS — Kernel Entry Point
// =============================================================================
//
// WHAT HAPPENED BEFORE WE GOT HERE:
//   1. A Multiboot loader (GRUB, or QEMU's -kernel) found the header below
//   2. It loaded the image at 1 MiB and switched to 32-bit protected mode
//      with its own flat segments, paging off and interrupts disabled
//   3. It jumped to `_start` with the Multiboot magic in EAX and the info
//      pointer in EBX
//
// WHAT WE DO HERE:
//   Phase 1: "Can Talk"   → serial logger
//   Phase 2: "Has Tables" → our own GDT + TSS, then the IDT and the PICs
//   Phase 3: "Can Hear"   → timer, keyboard and mouse on their lines
//   Phase 4: "Alive"      → `sti`, then echo keyboard lines to the log
//
// On a host build this file compiles to an empty `main` so the workspace
// still builds and tests without the bare-metal target.
// =============================================================================

#![cfg_attr(target_os = "none", no_std, no_main)]

#[cfg(not(target_os = "none"))]
fn main() {}

#[cfg(all(target_os = "none", target_arch = "x86"))]
mod boot {
    use core::panic::PanicInfo;

    use kdisplay::{CHAR_HEIGHT, Color, Surface, TextModeSurface, VGA_TEXT_BASE};
    use khal::cpu;
    use pmos_kernel::arch::gdt;
    use pmos_kernel::drivers::{self, keyboard, timer};
    use pmos_kernel::{KernelConfig, traps};

    /// Value a Multiboot-compliant loader leaves in EAX.
    const MULTIBOOT_BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

    const CONFIG: KernelConfig = KernelConfig::DEFAULT;

    // Multiboot header, the boot stack and the jump into Rust.
    core::arch::global_asm!(
        r#"
        .section .multiboot, "a"
        .balign 4
        .long 0x1BADB002
        .long 0x00000003
        .long -(0x1BADB002 + 0x00000003)

        .section .bss
        .balign 16
        .global __kernel_stack_bottom
        __kernel_stack_bottom:
        .skip 16384
        .global __kernel_stack_top
        __kernel_stack_top:

        .section .text
        .global _start
        _start:
            mov esp, offset __kernel_stack_top
            push ebx
            push eax
            call kmain
        2:
            cli
            hlt
            jmp 2b
        "#
    );

    unsafe extern "C" {
        static __kernel_stack_top: u8;
    }

    #[unsafe(no_mangle)]
    extern "C" fn kmain(magic: u32, _info: u32) -> ! {
        // =====================================================================
        // PHASE 1: "Can Talk" → serial logger
        // =====================================================================
        klog::init(CONFIG.log_level);
        klog::println!();
        klog::println!("==========================================================");
        klog::println!("  PMOS v{}", env!("CARGO_PKG_VERSION"));
        klog::println!("  32-bit protected-mode core for i686");
        klog::println!("==========================================================");

        if magic != MULTIBOOT_BOOTLOADER_MAGIC {
            log::warn!("boot: unexpected loader magic {:#010x}", magic);
        }

        // =====================================================================
        // PHASE 2: "Has Tables" → GDT + TSS, IDT, PIC remap
        // =====================================================================
        // SAFETY: only the address of the linker-placed symbol is taken.
        let stack_top = unsafe { &raw const __kernel_stack_top } as usize as u32;
        gdt::build_segments(stack_top);
        traps::init(&CONFIG);

        // =====================================================================
        // PHASE 3: "Can Hear" → drivers
        // =====================================================================
        if let Err(err) = drivers::init(&CONFIG) {
            log::error!("boot: driver setup failed: {:?}", err);
        }
        if let Err(err) = timer::register_periodic(heartbeat, 0, 60_000) {
            log::warn!("boot: no heartbeat: {:?}", err);
        }

        // =====================================================================
        // PHASE 4: "Alive"
        // =====================================================================
        cpu::enable_interrupts();
        log::info!("boot: interrupts enabled, waiting for input");

        let mut line = [0u8; 128];
        loop {
            let len = keyboard::read_line(&mut line);
            match core::str::from_utf8(&line[..len]) {
                Ok(text) => log::info!("keyboard: {:?}", text),
                Err(_) => log::info!("keyboard: {:02x?}", &line[..len]),
            }
        }
    }

    fn heartbeat(_: usize) {
        log::info!("uptime {}", timer::time_string());
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        cpu::disable_interrupts();
        log::error!("KERNEL PANIC: {}", info);

        // SAFETY: interrupts are off; nothing else draws from here on.
        let mut display = unsafe { TextModeSurface::new(VGA_TEXT_BASE) };
        let width = display.width();
        display.fill_rect(0, 0, width, CHAR_HEIGHT * 3, Color::RED);
        display.draw_string(8, 0, "KERNEL PANIC", Color::WHITE);
        if let Some(location) = info.location() {
            display.draw_fmt(
                8,
                CHAR_HEIGHT,
                format_args!("at {}:{}", location.file(), location.line()),
                Color::WHITE,
            );
        }
        display.draw_fmt(8, CHAR_HEIGHT * 2, format_args!("{}", info.message()), Color::WHITE);

        cpu::halt_forever()
    }
}
