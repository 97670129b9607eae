use std::env;
use std::path::Path;

fn main() {
	let kernel_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
	println!("cargo:rerun-if-changed=linker.ld");
	println!("cargo:rerun-if-changed=src/arch/stubs.S");

	// Host builds (tests) link normally; only the bare-metal image needs the
	// Multiboot layout.
	if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("none") {
		println!(
			"cargo:rustc-link-arg-bin=pmos=-T{}",
			kernel_dir.join("linker.ld").display()
		);
	}
}
