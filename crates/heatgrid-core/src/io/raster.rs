//! GeoTIFF raster collaborator.
//!
//! Reads the first band of a GeoTIFF (any integer or float sample type,
//! widened to f32) together with its transform, EPSG code and GDAL nodata
//! value; writes single-band Float32 GeoTIFFs carrying the same tags.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek};
use std::path::Path;

use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

use crate::error::{Error, Result};
use crate::geo::{Crs, GeoTransform};
use crate::grid::Grid;

/// Sentinel assigned when a file declares no nodata value.
pub const DEFAULT_NODATA: f32 = -9999.0;

/// GDAL's private ASCII nodata tag.
const GDAL_NODATA_TAG: u16 = 42113;

// GeoKey ids and values (GeoTIFF 1.0).
const GEOKEY_MODEL_TYPE: u16 = 1024;
const GEOKEY_RASTER_TYPE: u16 = 1025;
const GEOKEY_GEOGRAPHIC_TYPE: u16 = 2048;
const GEOKEY_PROJECTED_TYPE: u16 = 3072;
const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;
const RASTER_PIXEL_IS_POINT: u16 = 2;
/// GeoKey value meaning "user defined".
const USER_DEFINED: u16 = 32767;

/// Raster read/write seam. Batch operations take a store so they can be
/// driven from memory.
pub trait RasterStore: Sync {
    fn read(&self, path: &Path) -> Result<Grid>;
    fn write(&self, grid: &Grid, path: &Path) -> Result<()>;
}

/// Filesystem GeoTIFF store.
#[derive(Debug, Default, Clone, Copy)]
pub struct GeoTiffStore;

impl RasterStore for GeoTiffStore {
    fn read(&self, path: &Path) -> Result<Grid> {
        read_grid(path)
    }

    fn write(&self, grid: &Grid, path: &Path) -> Result<()> {
        write_grid(grid, path)
    }
}

// ── Reading ──────────────────────────────────────────────────────────────────

pub fn read_grid(path: &Path) -> Result<Grid> {
    let file = File::open(path)?;
    let mut decoder = Decoder::new(BufReader::new(file))?.with_limits(Limits::unlimited());
    let (w, h) = decoder.dimensions()?;
    let (width, height) = (w as usize, h as usize);

    let geokeys = read_geokeys(&mut decoder)?;
    let mut transform = read_transform(&mut decoder)?;
    if geokey(&geokeys, GEOKEY_RASTER_TYPE) == Some(RASTER_PIXEL_IS_POINT) {
        transform = transform.shifted(-0.5, -0.5);
    }
    let crs = geokey(&geokeys, GEOKEY_PROJECTED_TYPE)
        .or_else(|| geokey(&geokeys, GEOKEY_GEOGRAPHIC_TYPE))
        .filter(|&code| code != USER_DEFINED)
        .map_or(Crs::Unknown, |code| Crs::Epsg(code as u32));
    let nodata = read_nodata(&mut decoder)?.unwrap_or(DEFAULT_NODATA);

    let samples = widen(decoder.read_image()?)?;
    let cells = width * height;
    if cells == 0 || samples.len() % cells != 0 {
        return Err(Error::Raster(format!(
            "{}: {} samples for a {width}x{height} image",
            path.display(),
            samples.len()
        )));
    }
    let bands = samples.len() / cells;
    let data = if bands == 1 {
        samples
    } else {
        samples.into_iter().step_by(bands).collect()
    };
    Grid::from_vec(data, width, height, transform, crs, nodata)
}

fn widen(img: DecodingResult) -> Result<Vec<f32>> {
    Ok(match img {
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        _ => return Err(Error::Raster("unsupported sample type".into())),
    })
}

fn read_transform<R: Read + Seek>(d: &mut Decoder<R>) -> Result<GeoTransform> {
    if let Some(v) = d.find_tag(Tag::ModelTransformationTag)? {
        let m = v.into_f64_vec()?;
        if m.len() >= 8 {
            return Ok(GeoTransform::from_gdal([m[3], m[0], m[1], m[7], m[4], m[5]]));
        }
    }
    let scale = d.find_tag(Tag::ModelPixelScaleTag)?.map(|v| v.into_f64_vec()).transpose()?;
    let tie = d.find_tag(Tag::ModelTiepointTag)?.map(|v| v.into_f64_vec()).transpose()?;
    match (scale, tie) {
        (Some(s), Some(t)) if s.len() >= 2 && t.len() >= 6 => {
            // Tiepoint (i, j, k, x, y, z) ties raster (i, j) to model (x, y).
            let origin_x = t[3] - t[0] * s[0];
            let origin_y = t[4] + t[1] * s[1];
            Ok(GeoTransform {
                origin_x,
                pixel_width: s[0],
                row_rotation: 0.0,
                origin_y,
                col_rotation: 0.0,
                pixel_height: -s[1],
            })
        }
        _ => Err(Error::Raster("no georeferencing tags".into())),
    }
}

fn read_geokeys<R: Read + Seek>(d: &mut Decoder<R>) -> Result<Vec<u16>> {
    Ok(d.find_tag(Tag::GeoKeyDirectoryTag)?
        .map(|v| v.into_u16_vec())
        .transpose()?
        .unwrap_or_default())
}

/// Inline (location 0) value of `key` in a GeoKey directory.
fn geokey(dir: &[u16], key: u16) -> Option<u16> {
    let count = *dir.get(3)? as usize;
    dir.get(4..4 + 4 * count)?
        .chunks_exact(4)
        .find(|e| e[0] == key && e[1] == 0)
        .map(|e| e[3])
}

fn read_nodata<R: Read + Seek>(d: &mut Decoder<R>) -> Result<Option<f32>> {
    let Some(v) = d.find_tag(Tag::from_u16_exhaustive(GDAL_NODATA_TAG))? else {
        return Ok(None);
    };
    let s = v.into_string()?;
    let s = s.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    Ok(s.to_ascii_lowercase().parse::<f32>().ok())
}

// ── Writing ──────────────────────────────────────────────────────────────────

pub fn write_grid(grid: &Grid, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file = BufWriter::new(File::create(path)?);
    let mut tiff = TiffEncoder::new(file)?;
    let mut image = tiff.new_image::<colortype::Gray32Float>(grid.width as u32, grid.height as u32)?;

    let gt = grid.transform;
    if gt.is_north_up() {
        let scale = [gt.pixel_width, -gt.pixel_height, 0.0];
        let tie = [0.0, 0.0, 0.0, gt.origin_x, gt.origin_y, 0.0];
        image.encoder().write_tag(Tag::ModelPixelScaleTag, &scale[..])?;
        image.encoder().write_tag(Tag::ModelTiepointTag, &tie[..])?;
    } else {
        let m = [
            gt.pixel_width, gt.row_rotation, 0.0, gt.origin_x,
            gt.col_rotation, gt.pixel_height, 0.0, gt.origin_y,
            0.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        image.encoder().write_tag(Tag::ModelTransformationTag, &m[..])?;
    }
    image.encoder().write_tag(Tag::GeoKeyDirectoryTag, &geokey_directory(grid.crs)[..])?;
    let nodata = format_nodata(grid.nodata);
    image
        .encoder()
        .write_tag(Tag::from_u16_exhaustive(GDAL_NODATA_TAG), nodata.as_str())?;
    image.write_data(&grid.data)?;
    Ok(())
}

fn geokey_directory(crs: Crs) -> Vec<u16> {
    let mut keys: Vec<[u16; 4]> = vec![[GEOKEY_RASTER_TYPE, 0, 1, RASTER_PIXEL_IS_AREA]];
    if let Some(code) = crs.epsg().and_then(|c| u16::try_from(c).ok()) {
        if crs.is_geographic() {
            keys.insert(0, [GEOKEY_MODEL_TYPE, 0, 1, MODEL_TYPE_GEOGRAPHIC]);
            keys.push([GEOKEY_GEOGRAPHIC_TYPE, 0, 1, code]);
        } else {
            keys.insert(0, [GEOKEY_MODEL_TYPE, 0, 1, MODEL_TYPE_PROJECTED]);
            keys.push([GEOKEY_PROJECTED_TYPE, 0, 1, code]);
        }
    }
    let mut dir = vec![1, 1, 0, keys.len() as u16];
    dir.extend(keys.into_iter().flatten());
    dir
}

fn format_nodata(v: f32) -> String {
    if v.is_nan() {
        "nan".to_string()
    } else {
        format!("{v}")
    }
}
