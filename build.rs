fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src/cli.rs");
    #[cfg(feature = "completion")]
    completion::generate();
}

#[cfg(feature = "completion")]
#[allow(dead_code)]
#[path = "src/cli.rs"]
mod cli;

#[cfg(feature = "completion")]
mod completion {
    use std::path::PathBuf;

    use clap::CommandFactory;
    use clap_complete::Shell;

    use super::cli;

    pub fn generate() {
        let out_dir = PathBuf::from(std::env::var_os("OUT_DIR").expect("set by cargo"))
            .join("completions");
        std::fs::create_dir_all(&out_dir).expect("failed to create completions directory");
        let mut cmd = cli::Cli::command();
        for shell in [Shell::Bash, Shell::Fish, Shell::Zsh] {
            clap_complete::generate_to(shell, &mut cmd, "iocmd", &out_dir)
                .expect("failed to generate completions");
        }
    }
}
