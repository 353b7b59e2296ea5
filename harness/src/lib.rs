pub mod container;

pub use container::{
    build_environment_image, check_build_inputs, detect_runtime, remove_image,
    verify_image_exists, ContainerBuildConfig, ContainerError, ContainerRuntime,
};
