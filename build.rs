// Build script to compile GLSL shaders to SPIR-V

use std::path::Path;
use std::process::Command;

const SHADER_DIR: &str = "assets/shaders";

fn main() {
    println!("cargo:rerun-if-changed={}", SHADER_DIR);

    let Ok(entries) = std::fs::read_dir(SHADER_DIR) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let stage = path.extension().and_then(|e| e.to_str());
        if matches!(stage, Some("vert") | Some("frag")) {
            let output = path.with_extension(format!("{}.spv", stage.unwrap()));
            compile_shader(&path, &output);
        }
    }
}

fn compile_shader(input: &Path, output: &Path) {
    // glslc ships with the Vulkan SDK
    let result = Command::new("glslc").arg(input).arg("-o").arg(output).status();

    match result {
        Ok(status) if status.success() => {
            println!("Compiled {} -> {}", input.display(), output.display());
        }
        Ok(status) => {
            panic!(
                "Failed to compile {}: exit code {:?}",
                input.display(),
                status.code()
            );
        }
        Err(e) => {
            eprintln!("Warning: glslc not found ({})", e);
            eprintln!("Shaders will not be compiled. Install the Vulkan SDK or compile manually:");
            eprintln!("  glslc {} -o {}", input.display(), output.display());
        }
    }
}
