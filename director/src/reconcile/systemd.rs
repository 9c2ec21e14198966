//! Generated systemd unit wrapping a compose project

use std::path::Path;

/// Render the unit file for a compose project. There is no trailing newline.
///
/// docker-compose derives the project name from the working directory. When
/// that differs from `project`, the unit pins it through the environment.
pub fn render_unit(compose_name: &str, directory: &str, project: &str, docker_compose_path: &str) -> String {
    let project_env = if implied_project(directory) == Some(project) {
        String::new()
    } else {
        format!("Environment=\"COMPOSE_PROJECT_NAME={project}\"\n")
    };
    format!(
        "[Unit]\n\
         Description={compose_name} service with docker compose managed by supercompose\n\
         Requires=docker.service\n\
         After=docker.service\n\
         \n\
         [Service]\n\
         Type=oneshot\n\
         RemainAfterExit=true\n\
         {project_env}\
         WorkingDirectory={directory}\n\
         ExecStart={docker_compose_path} up -d --remove-orphans\n\
         ExecStop={docker_compose_path} down\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target"
    )
}

fn implied_project(directory: &str) -> Option<&str> {
    Path::new(directory.trim_end_matches('/')).file_name()?.to_str()
}
