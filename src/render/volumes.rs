use crate::api::CinderApi;
use crate::cinder::{config_data_name, scripts_name, KOLLA_CONFIG_FILE};

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, EmptyDirVolumeSource, HostPathVolumeSource, Volume, VolumeMount,
};

pub const LOGS_VOLUME: &str = "logs";
const LOGS_DIR: &str = "/var/log/cinder";

fn config_map_volume(name: &str, config_map: String, mode: i32) -> Volume {
    Volume {
        name: name.to_owned(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(config_map),
            default_mode: Some(mode),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn empty_dir_volume(name: &str) -> Volume {
    Volume {
        name: name.to_owned(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_owned(),
        mount_path: path.to_owned(),
        read_only: Some(read_only),
        ..Default::default()
    }
}

/// Volumes of the API pods, without the TLS ones. The scripts and default config come from the
/// parent `Cinder`'s config maps, the custom config from the one generated for this resource.
pub fn volumes(instance: &CinderApi) -> Vec<Volume> {
    let parent = instance.parent_name();
    let mut volumes = vec![
        Volume {
            name: "etc-machine-id".to_owned(),
            host_path: Some(HostPathVolumeSource {
                path: "/etc/machine-id".to_owned(),
                ..Default::default()
            }),
            ..Default::default()
        },
        config_map_volume("scripts", scripts_name(parent), 0o755),
        config_map_volume("config-data", config_data_name(parent), 0o640),
        empty_dir_volume("config-data-merged"),
    ];
    for extra in instance.api_extra_mounts() {
        volumes.extend(extra.volumes.iter().cloned());
    }
    volumes.push(config_map_volume(
        "config-data-custom",
        config_data_name(instance.name()),
        0o640,
    ));
    volumes.push(empty_dir_volume(LOGS_VOLUME));
    volumes
}

/// Mounts for the service container, matching `volumes`
pub fn volume_mounts(instance: &CinderApi) -> Vec<VolumeMount> {
    let mut mounts = vec![
        mount("etc-machine-id", "/etc/machine-id", true),
        mount("scripts", "/usr/local/bin/container-scripts", true),
        mount("config-data", "/var/lib/config-data/default", true),
        mount("config-data-merged", "/var/lib/config-data/merged", false),
    ];
    for extra in instance.api_extra_mounts() {
        mounts.extend(extra.mounts.iter().cloned());
    }
    mounts.push(mount("config-data-custom", "/etc/cinder/cinder.conf.d", true));
    mounts.push(logs_mount());
    mounts.push(VolumeMount {
        sub_path: Some(KOLLA_CONFIG_FILE.to_owned()),
        ..mount("config-data", "/var/lib/kolla/config_files/config.json", true)
    });
    mounts
}

pub fn logs_mount() -> VolumeMount {
    mount(LOGS_VOLUME, LOGS_DIR, false)
}
