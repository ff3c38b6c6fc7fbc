use corral_cli::config::Config;
use corral_cli::{Cli, Commands, Context, Parser};
use corral_local_db::Database;

#[test]
fn test_cli_parsing_create() {
    let args = vec!["corral", "create", "web", "process", "--spec", r#"{"program":"sleep"}"#];

    let cli = Cli::try_parse_from(args).unwrap();
    match cli.command {
        Commands::Create(args) => {
            assert_eq!(args.name, "web");
            assert_eq!(args.type_, "process");
            assert_eq!(args.spec, r#"{"program":"sleep"}"#);
        }
        _ => panic!("expected create"),
    }
}

#[test]
fn test_cli_parsing_bulk_with_refs() {
    let args = vec!["corral", "stop", "web", "worker", "--no-wait"];

    let cli = Cli::try_parse_from(args).unwrap();
    assert!(cli.no_wait);
    match cli.command {
        Commands::Stop(args) => assert_eq!(args.references, vec!["web", "worker"]),
        _ => panic!("expected stop"),
    }
}

#[test]
fn test_cli_parsing_bulk_without_refs() {
    let cli = Cli::try_parse_from(vec!["corral", "restart"]).unwrap();
    assert!(matches!(cli.command, Commands::Restart(ref args) if args.references.is_empty()));
}

#[test]
fn test_cli_parsing_bulk_with_types() {
    let cli = Cli::try_parse_from(vec!["corral", "refresh", "-t", "volume", "--type", "network"]).unwrap();
    match cli.command {
        Commands::Refresh(args) => {
            let filter = args.filter();
            assert_eq!(filter.refs, None);
            assert_eq!(filter.types, Some(vec!["volume".to_string(), "network".to_string()]));
        }
        _ => panic!("expected refresh"),
    }
}

#[test]
fn test_cli_parsing_global_workspace() {
    let args = vec!["corral", "ls", "--all", "-w", "/srv/app", "--type", "process"];

    let cli = Cli::try_parse_from(args).unwrap();
    assert_eq!(cli.workspace.as_deref(), Some(std::path::Path::new("/srv/app")));
    match cli.command {
        Commands::Ls(args) => {
            assert!(args.all);
            assert_eq!(args.types, vec!["process"]);
        }
        _ => panic!("expected ls"),
    }
}

#[test]
fn test_cli_parsing_worker() {
    let cli = Cli::try_parse_from(vec!["corral", "worker", "--job", "j1", "-c", "2"]).unwrap();
    match cli.command {
        Commands::Worker(args) => {
            assert_eq!(args.job.as_deref(), Some("j1"));
            assert_eq!(args.concurrency, Some(2));
        }
        _ => panic!("expected worker"),
    }
}

#[test]
fn test_cli_parsing_export_procfile() {
    let cli = Cli::try_parse_from(vec!["corral", "export-procfile"]).unwrap();
    assert!(matches!(cli.command, Commands::ExportProcfile));
}

#[test]
fn test_cli_rejects_missing_ref() {
    assert!(Cli::try_parse_from(vec!["corral", "rm"]).is_err());
    assert!(Cli::try_parse_from(vec!["corral", "reconcile"]).is_err());
}

#[tokio::test]
async fn test_init_apply_and_destroy() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().join("app");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join("Procfile"), "web: sleep 30\n").unwrap();

    let config = Config::with_home(dir.path().join("home"));
    let ctx = Context::new(config, Database::open_in_memory().unwrap(), root.clone(), true);
    assert!(ctx.workspace().is_err());

    Commands::Init.run(&ctx).await.unwrap();
    let workspace = ctx.workspace().unwrap();

    let cli = Cli::try_parse_from(vec!["corral", "apply"]).unwrap();
    cli.command.run(&ctx).await.unwrap();
    let components = workspace
        .describe_components(&Default::default())
        .unwrap();
    assert_eq!(components.len(), 1);
    assert_eq!(components[0].name, "web");
    assert_eq!(components[0].type_, "process");

    let procfile = workspace.export_procfile().unwrap();
    assert_eq!(procfile, "web: sleep 30\n");

    Commands::Destroy.run(&ctx).await.unwrap();
    assert!(ctx.workspace().is_err());
}
