use anyhow::{ensure, Result};
use stagehand::prelude::*;
use stagehand::staging::StagingRead;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

const ELEMENTS: u32 = 64 * 1024;
const TEXTURE_SIZE: u32 = 256;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let validation = std::env::args().any(|arg| arg == "--validation");
    let core = SharedCore::new(build_core(
        AppInfo::default().name("upload").validation(validation),
    )?);
    let device = Arc::new(EruptDevice::new(core.clone()));
    let allocator = Rc::new(RefCell::new(DeviceMemoryAllocator::new(device)));
    let mut resources = ResourceAllocator::new(allocator.clone(), StagingConfig::default());

    // Command pool
    let create_info = vk::CommandPoolCreateInfoBuilder::new()
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        .queue_family_index(core.queue_family);
    let command_pool =
        unsafe { core.device.create_command_pool(&create_info, None, None) }.result()?;

    let allocate_info = vk::CommandBufferAllocateInfoBuilder::new()
        .command_pool(command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let command_buffer =
        unsafe { core.device.allocate_command_buffers(&allocate_info) }.result()?[0];

    let fence = unsafe {
        core.device
            .create_fence(&vk::FenceCreateInfoBuilder::new(), None, None)
            .result()?
    };

    unsafe {
        let begin_info = vk::CommandBufferBeginInfoBuilder::new()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        core.device
            .begin_command_buffer(command_buffer, &begin_info)
            .result()?;
    }

    // Uploads
    let data: Vec<u32> = (0..ELEMENTS).collect();
    let desc = BufferDesc::new(
        (ELEMENTS as usize * std::mem::size_of::<u32>()) as u64,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
    );
    let buffer = resources.create_buffer_with_data_typed(
        command_buffer,
        &desc,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        &data,
    )?;

    let pixels: Vec<u8> = (0..TEXTURE_SIZE * TEXTURE_SIZE)
        .flat_map(|i| {
            let (x, y) = (i % TEXTURE_SIZE, i / TEXTURE_SIZE);
            [x as u8, y as u8, 0x80, 0xff]
        })
        .collect();
    let image = resources.create_image_with_data(
        command_buffer,
        &ImageDesc::new_2d(
            TEXTURE_SIZE,
            TEXTURE_SIZE,
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED,
        ),
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        &pixels,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    )?;
    let texture = resources.create_texture(image, Some(&SamplerDesc::default()))?;

    // Read the buffer back once the upload landed
    unsafe {
        let barrier = vk::MemoryBarrierBuilder::new()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::TRANSFER_READ);
        core.device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            None,
            &[barrier],
            &[],
            &[],
        );
    }
    let readback: StagingRead =
        resources
            .staging_mut()
            .cmd_from_buffer(command_buffer, buffer.buffer(), 0, desc.size)?;

    unsafe {
        core.device.end_command_buffer(command_buffer).result()?;
        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfoBuilder::new().command_buffers(&command_buffers);
        core.device
            .queue_submit(core.queue, &[submit_info], Some(fence))
            .result()?;
    }
    resources.finalize_staging(Some(fence));
    tracing::info!(staging = ?resources.staging().utilization(), "submitted");

    unsafe {
        core.device
            .wait_for_fences(&[fence], true, u64::MAX)
            .result()?;
    }

    let bytes = resources
        .staging()
        .read(&readback)
        .ok_or_else(|| anyhow::format_err!("Readback released before it was read"))?;
    ensure!(
        bytemuck::cast_slice::<u8, u32>(bytes) == &data[..],
        "Readback doesn't match the uploaded data"
    );
    tracing::info!(bytes = readback.len(), "readback matches");

    let released = resources.release_staging()?;
    tracing::info!(released, "released staging sets");
    allocator.borrow().report();

    resources.destroy_texture(texture);
    resources.destroy_buffer(buffer);
    unsafe {
        core.device.destroy_fence(Some(fence), None);
        core.device.destroy_command_pool(Some(command_pool), None);
    }
    Ok(())
}
