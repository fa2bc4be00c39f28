use std::path::PathBuf;

use {anyhow::Result, clap::Subcommand, switchyard_gateway::auth::generate_token};

#[derive(Subcommand)]
pub enum TokenAction {
    /// Print a new random auth token.
    Generate {
        /// Also add the token to the config file and turn on `require_auth`.
        #[arg(long)]
        save: bool,
    },
}

pub fn handle_token(action: TokenAction) -> Result<()> {
    match action {
        TokenAction::Generate { save } => {
            let token = generate_token();
            if save {
                let path = save_token(&token)?;
                eprintln!("Token added to {}", path.display());
            }
            println!("{token}");
            Ok(())
        },
    }
}

fn save_token(token: &str) -> Result<PathBuf> {
    switchyard_config::update_config(|cfg| {
        cfg.require_auth = true;
        if !cfg.auth_tokens.iter().any(|t| t == token) {
            cfg.auth_tokens.push(token.to_string());
        }
    })
}
