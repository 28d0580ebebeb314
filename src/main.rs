use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::io;
use std::path::PathBuf;

use gitprof::{
    commands::{self, AddArgs},
    logger,
    manager::Manager,
    paths::Paths,
    platform::PlatformDefinition,
    profiles::{AuthMethod, ProfileFields, Secret},
    switch::SwitchOptions,
    ui::{ColorMode, Ui},
};

#[derive(Parser)]
#[command(name = "gitprof")]
#[command(about = "Git identity profile switcher - manage multiple Git accounts, tokens and SSH keys")]
#[command(version)]
struct Cli {
    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// When to use colors: always, auto, never
    #[arg(long, global = true, value_name = "WHEN", default_value = "auto")]
    color: ColorMode,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all profiles
    List,

    /// Show the current profile
    Current,

    /// Add a profile, or update one with --overwrite
    Add(AddCommand),

    /// Remove a profile (a backup is kept unless --no-backup)
    Remove {
        /// Name of the profile to remove
        name: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,

        /// Do not write a backup before removing
        #[arg(long)]
        no_backup: bool,
    },

    /// Switch Git identity, credentials and SSH key to a profile
    Switch {
        /// Name of the profile to activate
        name: String,

        /// Show what would change without changing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Manage hosting platforms
    #[command(subcommand)]
    Platforms(PlatformsCommand),

    /// Run diagnostics on the Git and SSH setup
    Doctor {
        /// Print the diagnosis as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
struct AddCommand {
    /// Name of the profile
    name: String,

    /// Git user name (also the account name on the platform)
    #[arg(long)]
    username: Option<String>,

    /// Git user email
    #[arg(long)]
    email: Option<String>,

    /// Personal access token for HTTPS
    #[arg(long, conflicts_with = "ask_token")]
    token: Option<String>,

    /// Prompt for the access token
    #[arg(long)]
    ask_token: bool,

    /// Path to the SSH private key
    #[arg(long, value_name = "PATH")]
    ssh_identity: Option<String>,

    /// Platform id (github, gitlab, bitbucket, huggingface, azuredevops or a custom one)
    #[arg(long)]
    platform: Option<String>,

    /// Host override for self-hosted instances
    #[arg(long)]
    host: Option<String>,

    /// ssh or https; inferred from --ssh-identity / --token when omitted
    #[arg(long, value_name = "METHOD")]
    auth_method: Option<AuthMethod>,

    /// Update an existing profile
    #[arg(long)]
    overwrite: bool,

    /// Write the SSH host alias for SSH profiles (--setup-ssh=false to skip)
    #[arg(long, value_name = "BOOL", default_value_t = true, action = clap::ArgAction::Set)]
    setup_ssh: bool,
}

#[derive(Subcommand)]
enum PlatformsCommand {
    /// List built-in and custom platforms
    List,

    /// Register a custom platform from flags or a YAML file
    Register {
        /// Platform id, e.g. gitea (overrides the id in a --yaml file)
        #[arg(required_unless_present = "yaml")]
        id: Option<String>,

        /// Host name, e.g. git.example.com
        #[arg(long, required_unless_present = "yaml")]
        default_host: Option<String>,

        /// Display name (defaults to the id)
        #[arg(long)]
        name: Option<String>,

        /// SSH URL prefix (defaults to git@<host>:)
        #[arg(long)]
        ssh_prefix: Option<String>,

        /// HTTPS URL prefix (defaults to https://<host>/)
        #[arg(long)]
        https_prefix: Option<String>,

        /// SSH user (defaults to git)
        #[arg(long)]
        ssh_user: Option<String>,

        /// Credential scope for tokens (defaults to the host)
        #[arg(long)]
        token_auth_scope: Option<String>,

        /// Read the definition (name, defaultHost, sshPrefix, httpsPrefix, ...) from a YAML file
        #[arg(
            long,
            value_name = "FILE",
            conflicts_with_all = ["default_host", "name", "ssh_prefix", "https_prefix", "ssh_user", "token_auth_scope"]
        )]
        yaml: Option<PathBuf>,

        /// Replace an existing platform with the same id
        #[arg(long)]
        force: bool,
    },
}

impl AddCommand {
    fn into_parts(self) -> (String, ProfileFields, AddArgs) {
        let fields = ProfileFields {
            username: self.username,
            email: self.email,
            token: self.token.map(Secret::new),
            ssh_identity: self.ssh_identity,
            platform: self.platform,
            host: self.host,
            auth_method: self.auth_method,
        };
        let args = AddArgs {
            overwrite: self.overwrite,
            ask_token: self.ask_token,
            skip_ssh_setup: !self.setup_ssh,
        };
        (self.name, fields, args)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logger::init_logger(cli.verbose);

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        clap_complete::generate(shell, &mut cmd, name, &mut io::stdout());
        return Ok(());
    }

    let ui = Ui::new(cli.color, cli.no_color);
    let mut manager = Manager::new(Paths::new()?);

    match cli.command {
        Commands::List => commands::list(&manager, &ui),
        Commands::Current => commands::current(&manager, &ui),
        Commands::Add(add) => {
            let (name, fields, args) = add.into_parts();
            commands::add(&manager, &name, fields, &args, &ui)
        }
        Commands::Remove {
            name,
            force,
            no_backup,
        } => commands::remove(&manager, &name, force, no_backup, &ui),
        Commands::Switch { name, dry_run } => {
            commands::switch(&manager, &name, &SwitchOptions { dry_run }, &ui)
        }
        Commands::Platforms(PlatformsCommand::List) => commands::platforms_list(&manager, &ui),
        Commands::Platforms(PlatformsCommand::Register {
            id,
            default_host,
            name,
            ssh_prefix,
            https_prefix,
            ssh_user,
            token_auth_scope,
            yaml,
            force,
        }) => match yaml {
            Some(file) => {
                commands::platforms_register_yaml(&mut manager, &file, id.as_deref(), force, &ui)
            }
            None => {
                let definition = PlatformDefinition {
                    id: None,
                    name,
                    default_host,
                    ssh_prefix,
                    https_prefix,
                    ssh_user,
                    token_auth_scope,
                };
                let id = id.unwrap_or_default();
                commands::platforms_register(&mut manager, &id, definition, force, &ui)
            }
        },
        Commands::Doctor { json } => commands::doctor(&manager, json, &ui),
        Commands::Completions { .. } => Ok(()),
    }
}
