pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Write logs to a file in addition to stderr
    #[arg(long, global = true)]
    pub log_file: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a new crawl
    Submit {
        /// Seed URL to start crawling from
        #[arg(required = true)]
        url: String,

        /// Maximum crawl depth relative to the seed
        #[arg(long)]
        max_depth: Option<usize>,

        /// Cap on links discovered during crawling
        #[arg(long)]
        max_pages: Option<usize>,

        /// Overall page cap for the crawl
        #[arg(short, long)]
        limit: Option<usize>,

        /// Path regexes a URL must match to be crawled
        #[arg(long, value_delimiter = ',')]
        include: Vec<String>,

        /// Path regexes that reject a URL
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<String>,

        /// Seed from the site's sitemap instead of crawling from the seed
        #[arg(long)]
        use_sitemap: bool,

        /// Follow links onto other hosts
        #[arg(long)]
        allow_external_links: bool,

        /// Emit discovered URLs without page content
        #[arg(long)]
        only_urls: bool,

        /// Use the direct HTTP fetcher instead of the renderer
        #[arg(long)]
        fast: bool,

        /// Include markdown in emitted documents
        #[arg(long)]
        markdown: bool,

        /// Include raw HTML in emitted documents
        #[arg(long)]
        raw_html: bool,

        /// Extra render settle time in milliseconds
        #[arg(long)]
        wait_for: Option<u64>,

        /// Webhook URL to deliver documents to (repeatable)
        #[arg(long)]
        webhook: Vec<String>,

        /// Tenant identifier
        #[arg(long, default_value = "default")]
        tenant: String,

        /// Tenant plan (free, hobby, standard, growth, scale)
        #[arg(long, default_value = "free")]
        plan: String,
    },

    /// Check the status of a crawl
    Status {
        #[arg(required = true)]
        crawl_id: String,
    },

    /// Cancel a crawl
    Cancel {
        #[arg(required = true)]
        crawl_id: String,
    },

    /// Run the worker pool
    Worker {
        /// Worker task count; defaults to one per CPU core
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Show the current configuration
    Config {
        /// Write the current configuration back as the default
        #[arg(short, long)]
        save: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Submit {
            url,
            max_depth,
            max_pages,
            limit,
            include,
            exclude,
            use_sitemap,
            allow_external_links,
            only_urls,
            fast,
            markdown,
            raw_html,
            wait_for,
            webhook,
            tenant,
            plan,
        } => {
            info!("Submitting crawl for {}", url);
            commands::submit(commands::SubmitArgs {
                url,
                max_depth,
                max_pages,
                limit,
                include,
                exclude,
                use_sitemap,
                allow_external_links,
                only_urls,
                fast,
                markdown,
                raw_html,
                wait_for,
                webhook,
                tenant,
                plan,
            })
            .await
        }
        Commands::Status { crawl_id } => {
            info!("Checking status for crawl {}", crawl_id);
            commands::status(crawl_id).await
        }
        Commands::Cancel { crawl_id } => {
            info!("Cancelling crawl {}", crawl_id);
            commands::cancel(crawl_id).await
        }
        Commands::Worker { workers } => {
            info!("Starting worker pool");
            commands::worker(workers).await
        }
        Commands::Config { save } => commands::show_config(save).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn test_include_accepts_comma_strings() {
        let cli = Cli::parse_from([
            "webharvest",
            "submit",
            "https://ex.com/",
            "--include",
            "^/docs,^/blog",
        ]);
        match cli.command {
            Commands::Submit { include, .. } => {
                assert_eq!(include, vec!["^/docs", "^/blog"]);
            }
            _ => panic!("expected submit"),
        }
    }
}
