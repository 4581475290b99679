use ash::vk;
use color_eyre::Result;
use crate::renderer::contexts::device_ctx::types::*;
use crate::renderer::contexts::device_ctx::vulkan::conv;
use crate::renderer::contexts::device_ctx::vulkan::VulkanDevice;
use crate::renderer::error::driver_error;

/// What the encoder remembers between commands of one list.
#[derive(Debug, Default)]
pub struct RecordState {
    pub recording: bool,
    pass: Option<(RenderTarget, ImageId)>,
    bound_layout: Option<vk::PipelineLayout>,
}

impl RecordState {
    pub fn begin() -> Self {
        Self {
            recording: true,
            ..Default::default()
        }
    }

    pub fn in_pass(&self) -> bool {
        self.pass.is_some()
    }
}

struct PassImages {
    extent: Extent2D,
    color: ImageId,
    depth: Option<ImageId>,
}

impl VulkanDevice {
    /// Encodes one command into `cmd`, tracking image layouts as it goes.
    pub(super) fn encode(&mut self, cmd: vk::CommandBuffer, state: &mut RecordState, command: &Command) -> Result<()> {
        const OP: &str = "record";
        let device = self.core.logical.clone();
        match command {
            Command::BeginRenderPass { target, clear_color, clear_depth } => {
                if state.pass.is_some() {
                    return Err(driver_error(OP, "render pass begun inside another"));
                }
                let pass = self.pass_images(*target)?;
                self.transition(cmd, pass.color, 0, 1, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)?;
                if let Some(depth) = pass.depth {
                    self.transition(cmd, depth, 0, 1, vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)?;
                }

                let color_view = self.image(OP, pass.color)?.view;
                let color_attachments = [vk::RenderingAttachmentInfo::default()
                    .image_view(color_view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(if clear_color.is_some() {
                        vk::AttachmentLoadOp::CLEAR
                    } else {
                        vk::AttachmentLoadOp::LOAD
                    })
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: clear_color.unwrap_or_default(),
                        },
                    })];
                let depth_attachment = match pass.depth {
                    Some(depth) => Some(
                        vk::RenderingAttachmentInfo::default()
                            .image_view(self.image(OP, depth)?.view)
                            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                            .load_op(if clear_depth.is_some() {
                                vk::AttachmentLoadOp::CLEAR
                            } else {
                                vk::AttachmentLoadOp::LOAD
                            })
                            .store_op(vk::AttachmentStoreOp::STORE)
                            .clear_value(vk::ClearValue {
                                depth_stencil: vk::ClearDepthStencilValue {
                                    depth: clear_depth.unwrap_or(1.0),
                                    stencil: 0,
                                },
                            }),
                    ),
                    None => None,
                };
                let area = vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: vk::Extent2D {
                        width: pass.extent.width,
                        height: pass.extent.height,
                    },
                };
                let mut info = vk::RenderingInfo::default()
                    .render_area(area)
                    .layer_count(1)
                    .color_attachments(&color_attachments);
                if let Some(depth) = depth_attachment.as_ref() {
                    info = info.depth_attachment(depth);
                }
                unsafe {
                    device.cmd_begin_rendering(cmd, &info);
                    device.cmd_set_viewport(
                        cmd,
                        0,
                        &[vk::Viewport {
                            x: 0.0,
                            y: 0.0,
                            width: pass.extent.width as f32,
                            height: pass.extent.height as f32,
                            min_depth: 0.0,
                            max_depth: 1.0,
                        }],
                    );
                    device.cmd_set_scissor(cmd, 0, &[area]);
                }
                state.pass = Some((*target, pass.color));
            }
            Command::EndRenderPass => {
                let (target, color) = state
                    .pass
                    .take()
                    .ok_or_else(|| driver_error(OP, "render pass ended without being begun"))?;
                unsafe { device.cmd_end_rendering(cmd) };
                if target.is_surface() {
                    self.transition(cmd, color, 0, 1, vk::ImageLayout::PRESENT_SRC_KHR)?;
                }
                state.bound_layout = None;
            }
            Command::SetViewport(viewport) => unsafe {
                device.cmd_set_viewport(
                    cmd,
                    0,
                    &[vk::Viewport {
                        x: viewport.x,
                        y: viewport.y,
                        width: viewport.width,
                        height: viewport.height,
                        min_depth: viewport.min_depth,
                        max_depth: viewport.max_depth,
                    }],
                );
            },
            Command::SetScissor(scissor) => unsafe {
                device.cmd_set_scissor(
                    cmd,
                    0,
                    &[vk::Rect2D {
                        offset: vk::Offset2D {
                            x: scissor.x.max(0),
                            y: scissor.y.max(0),
                        },
                        extent: vk::Extent2D {
                            width: scissor.width,
                            height: scissor.height,
                        },
                    }],
                );
            },
            Command::BindPipeline(pipeline) => {
                let pipeline = self
                    .pipelines
                    .get(pipeline)
                    .ok_or_else(|| driver_error(OP, format!("unknown pipeline {pipeline:?}")))?;
                unsafe { device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.raw) };
                state.bound_layout = Some(pipeline.layout);
            }
            Command::BindBindingSet(set) => {
                let layout = state
                    .bound_layout
                    .ok_or_else(|| driver_error(OP, "binding set bound before a pipeline"))?;
                let raw = *self
                    .binding_sets
                    .get(set)
                    .ok_or_else(|| driver_error(OP, format!("unknown binding set {set:?}")))?
                    .set
                    .raw();
                unsafe {
                    device.cmd_bind_descriptor_sets(cmd, vk::PipelineBindPoint::GRAPHICS, layout, 0, &[raw], &[]);
                }
            }
            Command::BindVertexBuffers { first_binding, buffers } => {
                let raws = buffers
                    .iter()
                    .map(|id| self.buffer(OP, *id).map(|b| b.raw))
                    .collect::<Result<smallvec::SmallVec<[vk::Buffer; 4]>>>()?;
                let offsets = smallvec::SmallVec::<[vk::DeviceSize; 4]>::from_elem(0, raws.len());
                unsafe { device.cmd_bind_vertex_buffers(cmd, *first_binding, &raws, &offsets) };
            }
            Command::BindIndexBuffer { buffer, format } => {
                let raw = self.buffer(OP, *buffer)?.raw;
                unsafe { device.cmd_bind_index_buffer(cmd, raw, 0, conv::index_type(*format)) };
            }
            Command::Draw { vertex_count, first_vertex } => {
                if state.pass.is_none() {
                    return Err(driver_error(OP, "draw outside a render pass"));
                }
                unsafe { device.cmd_draw(cmd, *vertex_count, 1, *first_vertex, 0) };
            }
            Command::DrawIndexed { index_count, first_index, vertex_offset } => {
                if state.pass.is_none() {
                    return Err(driver_error(OP, "draw outside a render pass"));
                }
                unsafe { device.cmd_draw_indexed(cmd, *index_count, 1, *first_index, *vertex_offset, 0) };
            }
            Command::CopyBuffer { src, dst, size } => {
                let (src, dst) = (self.buffer(OP, *src)?.raw, self.buffer(OP, *dst)?.raw);
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: *size,
                };
                unsafe { device.cmd_copy_buffer(cmd, src, dst, &[region]) };
                memory_barrier(&device, cmd);
            }
            Command::CopyBufferToImage { buffer, image, mip_level } => {
                let raw_buffer = self.buffer(OP, *buffer)?.raw;
                let target = self.image(OP, *image)?;
                require_layout(target.layouts.get(*mip_level as usize), vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
                let extent = target.level_extent(*mip_level);
                let region = vk::BufferImageCopy {
                    buffer_offset: 0,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: target.aspect(),
                        mip_level: *mip_level,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    image_offset: vk::Offset3D::default(),
                    image_extent: vk::Extent3D {
                        width: extent.width,
                        height: extent.height,
                        depth: 1,
                    },
                };
                unsafe {
                    device.cmd_copy_buffer_to_image(
                        cmd,
                        raw_buffer,
                        target.raw,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
                memory_barrier(&device, cmd);
            }
            Command::CopyImageToBuffer { image, buffer } => {
                let raw_buffer = self.buffer(OP, *buffer)?.raw;
                let source = self.image(OP, *image)?;
                require_layout(source.layouts.first(), vk::ImageLayout::TRANSFER_SRC_OPTIMAL)?;
                let region = vk::BufferImageCopy {
                    buffer_offset: 0,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: source.aspect(),
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    image_offset: vk::Offset3D::default(),
                    image_extent: vk::Extent3D {
                        width: source.extent.width,
                        height: source.extent.height,
                        depth: 1,
                    },
                };
                unsafe {
                    device.cmd_copy_image_to_buffer(
                        cmd,
                        source.raw,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        raw_buffer,
                        &[region],
                    );
                }
                memory_barrier(&device, cmd);
            }
            Command::TransitionImage { image, base_mip, mip_count, layout } => {
                self.transition(cmd, *image, *base_mip, *mip_count, conv::image_layout(*layout))?;
            }
            Command::BlitMip { image, src_level } => {
                let target = self.image(OP, *image)?;
                let dst_level = src_level + 1;
                require_layout(target.layouts.get(*src_level as usize), vk::ImageLayout::TRANSFER_SRC_OPTIMAL)?;
                require_layout(target.layouts.get(dst_level as usize), vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
                let (src, dst) = (target.level_extent(*src_level), target.level_extent(dst_level));
                let subresource = |mip_level| vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level,
                    base_array_layer: 0,
                    layer_count: 1,
                };
                let regions = [vk::ImageBlit2::default()
                    .src_subresource(subresource(*src_level))
                    .src_offsets([
                        vk::Offset3D::default(),
                        vk::Offset3D {
                            x: src.width as i32,
                            y: src.height as i32,
                            z: 1,
                        },
                    ])
                    .dst_subresource(subresource(dst_level))
                    .dst_offsets([
                        vk::Offset3D::default(),
                        vk::Offset3D {
                            x: dst.width as i32,
                            y: dst.height as i32,
                            z: 1,
                        },
                    ])];
                let info = vk::BlitImageInfo2::default()
                    .src_image(target.raw)
                    .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                    .dst_image(target.raw)
                    .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .filter(vk::Filter::LINEAR)
                    .regions(&regions);
                unsafe { device.cmd_blit_image2(cmd, &info) };
                memory_barrier(&device, cmd);
            }
        }
        Ok(())
    }

    fn pass_images(&self, target: RenderTarget) -> Result<PassImages> {
        const OP: &str = "begin_render_pass";
        match target {
            RenderTarget::Surface => {
                let surface = self
                    .surface
                    .as_ref()
                    .ok_or_else(|| driver_error(OP, "device has no surface"))?;
                let index = surface
                    .acquired
                    .ok_or_else(|| driver_error(OP, "no surface image is acquired"))?;
                Ok(PassImages {
                    extent: surface.swapchain.extent,
                    color: surface.images[index as usize],
                    depth: Some(surface.depth),
                })
            }
            RenderTarget::Offscreen(id) => {
                let t = self
                    .targets
                    .get(&id)
                    .ok_or_else(|| driver_error(OP, format!("unknown target {id:?}")))?;
                Ok(PassImages {
                    extent: t.extent,
                    color: t.color,
                    depth: t.depth,
                })
            }
        }
    }

    /// Moves the given mips of `image` to `layout`, skipping mips already there.
    fn transition(
        &mut self,
        cmd: vk::CommandBuffer,
        image: ImageId,
        base_mip: u32,
        mip_count: u32,
        layout: vk::ImageLayout,
    ) -> Result<()> {
        const OP: &str = "record";
        let device = self.core.logical.clone();
        let target = self
            .images
            .get_mut(&image)
            .ok_or_else(|| driver_error(OP, format!("unknown image {image:?}")))?;
        let end = (base_mip + mip_count) as usize;
        if end > target.layouts.len() {
            return Err(driver_error(OP, format!("{image:?} has only {} mips", target.layouts.len())));
        }
        let aspect = target.aspect();
        let raw = target.raw;
        let barriers: smallvec::SmallVec<[vk::ImageMemoryBarrier2; 4]> = target.layouts[base_mip as usize..end]
            .iter_mut()
            .enumerate()
            .filter(|(_, current)| **current != layout)
            .map(|(offset, current)| {
                let old = std::mem::replace(current, layout);
                vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                    .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
                    .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                    .dst_access_mask(vk::AccessFlags2::MEMORY_WRITE | vk::AccessFlags2::MEMORY_READ)
                    .old_layout(old)
                    .new_layout(layout)
                    .image(raw)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: aspect,
                        base_mip_level: base_mip + offset as u32,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
            })
            .collect();
        if !barriers.is_empty() {
            let info = vk::DependencyInfo::default().image_memory_barriers(&barriers);
            unsafe { device.cmd_pipeline_barrier2(cmd, &info) };
        }
        Ok(())
    }
}

/// Makes transfer writes visible to whatever runs next, in this or a later submission.
fn memory_barrier(device: &ash::Device, cmd: vk::CommandBuffer) {
    let barriers = [vk::MemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .dst_access_mask(vk::AccessFlags2::MEMORY_WRITE | vk::AccessFlags2::MEMORY_READ)];
    let info = vk::DependencyInfo::default().memory_barriers(&barriers);
    unsafe { device.cmd_pipeline_barrier2(cmd, &info) };
}

fn require_layout(current: Option<&vk::ImageLayout>, expected: vk::ImageLayout) -> Result<()> {
    match current {
        Some(layout) if *layout == expected => Ok(()),
        Some(layout) => Err(driver_error("record", format!("image is in {layout:?}, expected {expected:?}"))),
        None => Err(driver_error("record", "mip level out of range")),
    }
}
