use trebuchet::App;
use trebuchet::container::{Mount, RestartPolicy};
use trebuchet::workflow::{app_container, build_container};

#[test]
fn defaults() {
    let app = App::new("myapp");

    assert_eq!(app.name, "myapp");
    assert_eq!(app.image, "myapp");
    assert_eq!(app.dockerfile, "Dockerfile");
    assert_eq!(app.platform, "linux/amd64");
    assert_eq!(app.target.as_deref(), Some("production"));
    assert_eq!(app.port, 3000);
    assert!(app.build_args.is_empty());
    assert!(app.env.is_empty());
    assert!(app.healthcheck.is_none());
}

#[test]
fn builder_chain() {
    let app = App::new("test")
        .image("acme/web")
        .dockerfile("deploy/Dockerfile")
        .platform("linux/arm64")
        .build_arg("NODE_VERSION", "22")
        .build_arg("PNPM_VERSION", "9")
        .env("HOST", "0.0.0.0")
        .env("PORT", "8080")
        .port(8080)
        .healthcheck("wget -q --spider http://localhost:8080/");

    assert_eq!(app.image_tag(), "acme/web:latest");
    assert_eq!(app.dockerfile, "deploy/Dockerfile");
    assert_eq!(app.platform, "linux/arm64");
    let args: Vec<(&str, &str)> = app
        .build_args
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    assert_eq!(args, [("NODE_VERSION", "22"), ("PNPM_VERSION", "9")]);
    assert_eq!(app.env["PORT"], "8080");
    assert_eq!(app.upstream(), "test:8080");
}

#[test]
fn env_overrides_keep_position() {
    let app = App::new("x").env("A", "1").env("B", "2").env("A", "3");

    let keys: Vec<&String> = app.env.keys().collect();
    assert_eq!(keys, ["A", "B"]);
    assert_eq!(app.env["A"], "3");
}

#[test]
fn no_target_builds_the_last_stage() {
    let app = App::new("x").target("builder").no_target();

    assert!(app.target.is_none());
}

#[test]
fn build_container_is_one_shot_on_the_volume() {
    let app = App::new("app").build_output("/app/.next");

    let spec = build_container(&app);

    assert_eq!(spec.name, "app_container_build");
    assert!(spec.one_shot);
    assert!(spec.networks.is_empty());
    assert_eq!(
        spec.mounts,
        [Mount::volume("app_volume_build", "/app/.next")]
    );
    assert_eq!(spec.command, ["pnpm", "build"]);
}

#[test]
fn app_container_joins_both_networks() {
    let app = App::new("app").healthcheck("true").env("NODE_ENV", "production");

    let spec = app_container(&app);

    assert_eq!(spec.name, "app");
    assert_eq!(spec.image, "app:latest");
    assert_eq!(spec.networks, ["app_network_public", "app_network_internal"]);
    assert_eq!(spec.restart, RestartPolicy::Always);
    assert!(spec.ports.is_empty());
    assert_eq!(spec.healthcheck.unwrap().test, "true");
    assert_eq!(spec.env, [("NODE_ENV".to_string(), "production".to_string())]);
}

#[test]
fn yaml_fields_default() {
    let app: App = serde_yaml::from_str("name: web\nport: 8080\n").unwrap();

    assert_eq!(app.name, "web");
    assert_eq!(app.port, 8080);
    assert_eq!(app.dockerfile, "Dockerfile");
}
